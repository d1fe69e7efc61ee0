use clap::Parser;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use dbbridge::config::AppConfig;
use dbbridge::startup;

#[derive(Parser, Debug)]
#[command(name = "dbbridge")]
#[command(about = "A multi-backend database gateway")]
struct Args {
    /// Configuration file path (default: config.yaml)
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Port to listen on (overrides config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config file)
    #[arg(long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt::init();

    let mut app_config = if args.config == "config.yaml" && !std::path::Path::new("config.yaml").exists() {
        println!("No config.yaml found, using the default configuration:");
        println!("   - In-memory SQLite service at /api/db");
        println!("   - Listening on 127.0.0.1:3000\n");
        AppConfig::default_config()
    } else {
        AppConfig::load_from_file(&args.config)
            .map_err(|e| format!("Failed to load configuration: {}", e))?
    };

    if let Some(port) = args.port {
        app_config.server.port = port;
    }
    if let Some(host) = args.host {
        app_config.server.host = host;
    }

    let services = startup::connect_services(&app_config).await?;
    println!("Configured services:");
    for service in &app_config.services {
        println!("   - /api/{} ({})", service.name, service.backend_type);
    }

    let app = startup::build_router(services);

    let host: std::net::IpAddr = app_config.server.host.parse().unwrap_or_else(|_| {
        eprintln!("Invalid host address: {}, using 127.0.0.1", app_config.server.host);
        [127, 0, 0, 1].into()
    });
    let addr = SocketAddr::from((host, app_config.server.port));
    println!("dbbridge listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
