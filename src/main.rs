use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use vmdef::definition::{parse_size, VmDefinition};
use vmdef::tree::{self, XmlNode, XmlValue};
use vmdef::virsh;

#[derive(Parser)]
#[command(name = "vmdef", about = "Manage libvirt virtual machines through typed domain definitions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List all virtual machines known to the hypervisor
    List,
    /// Show the typed definition of a virtual machine as JSON
    Show { name: String },
    /// Print the raw domain XML
    Xml { name: String },
    /// Update fields of a virtual machine definition
    Set {
        name: String,
        /// New memory size, e.g. 4GiB or 512MiB
        #[arg(long)]
        memory: Option<String>,
        #[arg(long)]
        vcpus: Option<u32>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Command::List => {
            let instances = virsh::list_all().await?;
            println!("{}", serde_json::to_string_pretty(&instances)?);
        }
        Command::Show { name } => {
            let definition = fetch_definition(&name).await?;
            println!("{}", serde_json::to_string_pretty(&definition)?);
        }
        Command::Xml { name } => {
            print!("{}", virsh::get_domain_xml(&name).await?);
        }
        Command::Set {
            name,
            memory,
            vcpus,
            title,
            description,
        } => {
            let mut definition = fetch_definition(&name).await?;
            if let Some(memory) = memory {
                definition.memory =
                    Some(parse_size(&memory).with_context(|| format!("invalid size: {memory}"))?);
            }
            if let Some(vcpus) = vcpus {
                definition.vcpu_count = Some(vcpus);
            }
            if let Some(title) = title {
                definition.title = Some(title);
            }
            if let Some(description) = description {
                definition.description = Some(description);
            }

            // re-fetch so a concurrent edit since our decode is detected
            let current = fetch_domain_tree(&name).await?;
            let encoded = definition.encode_checked(&current)?;
            let mut document = XmlNode::default();
            document.put_child("domain", XmlValue::Node(encoded));
            virsh::define_domain(&tree::write_document(&document)?).await?;
            info!("Updated definition for {}", name);
        }
    }
    Ok(())
}

async fn fetch_definition(name: &str) -> anyhow::Result<VmDefinition> {
    let root = fetch_domain_tree(name).await?;
    Ok(VmDefinition::decode(XmlValue::Node(root))?)
}

async fn fetch_domain_tree(name: &str) -> anyhow::Result<XmlNode> {
    let xml = virsh::get_domain_xml(name).await?;
    let mut document = tree::parse_document(&xml)?;
    match document.take_child("domain") {
        Some(XmlValue::Node(node)) => Ok(node),
        _ => bail!("no <domain> element in dumpxml output for {name}"),
    }
}
