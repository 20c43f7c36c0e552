use clap::Args;
use serde::Serialize;

use super::{connect, OutputFormat};
use crate::config::Config;

/// Show the owner id the configured API key acts for
#[derive(Args)]
pub struct WhoamiCommand {
    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Serialize)]
struct Whoami<'a> {
    owner_id: String,
    server_url: &'a str,
}

impl WhoamiCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let (remote, owner) = connect(config).await?;
        let whoami = Whoami {
            owner_id: owner.to_string(),
            server_url: remote.server_url(),
        };

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&whoami)?),
            OutputFormat::Text => {
                println!("Owner:  {}", whoami.owner_id);
                println!("Server: {}", whoami.server_url);
            }
        }
        Ok(())
    }
}
