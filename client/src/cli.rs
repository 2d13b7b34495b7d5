use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use common::{
    auth::{sign_uri, HmacAuth},
    rpc::{self, into_data},
    store::{NodeKind, NodeRecord, NodeStatus, FEATURE_ARIA2},
    task::{TaskType, TransferProps},
    Response,
};
use serde_json::{json, Value};
use std::{env, sync::Arc, time::Duration};

/// - En Docker: MASTER_URL=http://master:5212
/// - Local: default http://localhost:5212
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:5212".to_string())
}

fn secret() -> Result<String> {
    env::var("STRATUS_SECRET").context("falta STRATUS_SECRET con el secreto del master")
}

#[derive(Parser)]
#[command(name = "stratus")]
#[command(about = "CLI de administración del clúster Stratus")]
struct Cli {
    /// Validez de las firmas en segundos
    #[arg(long, default_value_t = 60, global = true)]
    ttl: i64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Comprueba que el master responde
    Health,
    /// Gestión de nodos esclavos
    #[command(subcommand)]
    Nodes(NodeCommands),
    /// Tareas en segundo plano
    #[command(subcommand)]
    Tasks(TaskCommands),
    /// Copia ficheros de un nodo al almacenamiento de un propietario
    Transfer {
        /// Rutas de origen en el nodo
        #[arg(value_name = "ORIGEN", required = true)]
        src: Vec<String>,
        /// Carpeta de destino
        #[arg(long, default_value = "/")]
        dst: String,
        /// Nodo donde están los orígenes (1 = master)
        #[arg(long, default_value_t = 1)]
        node: u64,
        #[arg(long, default_value_t = 1)]
        owner: u64,
    },
    /// Crea una descarga en el primer nodo con aria2
    Download {
        #[arg(value_name = "URL")]
        url: String,
    },
    /// Firma una URI con el secreto del master
    SignUri {
        #[arg(value_name = "URI")]
        uri: String,
    },
}

#[derive(Subcommand)]
enum NodeCommands {
    List,
    Add(NodeArgs),
    /// Activa o suspende un nodo
    Toggle {
        id: u64,
        #[arg(long)]
        suspend: bool,
    },
    Delete {
        id: u64,
    },
}

#[derive(Args)]
struct NodeArgs {
    #[arg(long)]
    name: String,
    /// URL base del esclavo
    #[arg(long)]
    server: String,
    #[arg(long)]
    slave_key: String,
    #[arg(long)]
    master_key: String,
    /// El nodo puede recibir descargas
    #[arg(long)]
    aria2: bool,
    #[arg(long, default_value_t = 0)]
    rank: i32,
}

#[derive(Subcommand)]
enum TaskCommands {
    List,
    Show {
        id: u64,
    },
    /// Envía una tarea con propiedades en JSON
    Submit {
        /// compress, decompress, transfer o import
        #[arg(value_name = "TIPO")]
        kind: String,
        #[arg(value_name = "PROPS_JSON")]
        props: String,
        #[arg(long, default_value_t = 1)]
        owner: u64,
    },
}

fn parse_kind(raw: &str) -> Result<TaskType> {
    serde_json::from_value(Value::String(raw.to_lowercase()))
        .with_context(|| format!("tipo de tarea desconocido: {raw}"))
}

fn print(resp: Response) -> Result<()> {
    let data: Value = into_data(resp)?;
    if !data.is_null() {
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("ok");
    }
    Ok(())
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let base_url = master_base_url();

    if let Commands::Health = cli.command {
        let body = reqwest::get(format!("{base_url}/health")).await?.text().await?;
        println!("{body}");
        return Ok(());
    }

    let auth = Arc::new(HmacAuth::new(secret()?));
    if let Commands::SignUri { uri } = &cli.command {
        println!("{}", sign_uri(auth.as_ref(), uri, cli.ttl)?);
        return Ok(());
    }

    let client = rpc::Client::builder(format!("{base_url}/api/v1/"))
        .timeout(Duration::from_secs(30))
        .credential(auth, cli.ttl)
        .build()?;

    match cli.command {
        Commands::Nodes(NodeCommands::List) => {
            let nodes: Vec<Value> = into_data(client.get("admin/nodes").await?)?;
            if nodes.is_empty() {
                println!("No hay nodos registrados.");
            }
            for n in nodes {
                println!("Nodo {} ({})", n["id"], n["name"].as_str().unwrap_or_default());
                println!("  tipo    : {}", n["kind"]);
                println!("  estado  : {}", n["status"]);
                println!("  online  : {}", n["online"]);
                println!("  servidor: {}", n["server"].as_str().unwrap_or_default());
            }
        }
        Commands::Nodes(NodeCommands::Add(args)) => {
            let record = NodeRecord {
                id: 0,
                name: args.name,
                kind: NodeKind::Slave,
                status: NodeStatus::Active,
                server: args.server,
                slave_key: args.slave_key,
                master_key: args.master_key,
                features: if args.aria2 {
                    [FEATURE_ARIA2.to_string()].into_iter().collect()
                } else {
                    Default::default()
                },
                aria2: Default::default(),
                rank: args.rank,
            };
            print(client.post("admin/nodes", &record).await?)?;
        }
        Commands::Nodes(NodeCommands::Toggle { id, suspend }) => {
            let status = if suspend { NodeStatus::Suspended } else { NodeStatus::Active };
            let body = json!({ "status": status });
            print(client.patch(&format!("admin/nodes/{id}/status"), &body).await?)?;
        }
        Commands::Nodes(NodeCommands::Delete { id }) => {
            print(client.delete(&format!("admin/nodes/{id}")).await?)?;
        }
        Commands::Tasks(TaskCommands::List) => {
            let tasks: Vec<Value> = into_data(client.get("tasks").await?)?;
            for t in tasks {
                println!(
                    "#{} {} {} progreso={}",
                    t["id"], t["kind"], t["status"], t["progress"]
                );
                if let Some(msg) = t["error"]["msg"].as_str() {
                    println!("  error: {msg}");
                }
            }
        }
        Commands::Tasks(TaskCommands::Show { id }) => {
            print(client.get(&format!("tasks/{id}")).await?)?;
        }
        Commands::Tasks(TaskCommands::Submit { kind, props, owner }) => {
            let kind = parse_kind(&kind)?;
            let props: Value = serde_json::from_str(&props).context("PROPS_JSON no es JSON válido")?;
            let body = json!({ "kind": kind, "owner": owner, "props": props });
            print(client.post("tasks", &body).await?)?;
        }
        Commands::Transfer { src, dst, node, owner } => {
            let props = TransferProps {
                src,
                dst,
                node_id: node,
                ..TransferProps::default()
            };
            let body = json!({ "kind": TaskType::Transfer, "owner": owner, "props": props });
            print(client.post("tasks", &body).await?)?;
        }
        Commands::Download { url } => {
            print(client.post("admin/download", &json!({ "url": url })).await?)?;
        }
        Commands::Health | Commands::SignUri { .. } => bail!("comando ya atendido"),
    }

    Ok(())
}
