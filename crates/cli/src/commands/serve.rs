//! `tilt serve` — Start the HTTP API server.

use tilt_config::AppConfig;

pub async fn run(mut config: AppConfig, port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("Tilt Gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Model:     {} via {}", config.model.model, config.model.provider);
    println!("   Database:  {}", config.database.path);

    tilt_gateway::start(config).await?;

    Ok(())
}
