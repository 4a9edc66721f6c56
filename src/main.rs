#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use dotenv::dotenv;
use ssh_sftp::client::drive::complete;
use ssh_sftp::client::{Identity, Libssh2Engine, RetryPolicy, SessionConfig, connect_with_retry};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let host = std::env::var("SFTP_HOST")?;
    let username = std::env::var("SFTP_USER")?;
    let path = std::env::var("SFTP_PATH").unwrap_or_else(|_| ".".to_string());

    let mut config = SessionConfig::new(host, username).nonblocking(true);
    if let Ok(password) = std::env::var("SFTP_PASSWORD") {
        config = config.password(password);
    }
    if let Ok(key_path) = std::env::var("SFTP_IDENTITY") {
        config = config.identity(Identity::from_file(key_path)?);
    }

    let (mut session, retries) =
        connect_with_retry(config, Libssh2Engine::new, RetryPolicy::from_env()).await?;
    info!("Session {} ready after {} retries", session.id(), retries);

    let resolved = complete(&mut session.realpath(&path)).await?;
    info!("Listing {}", resolved.display());

    let mut dir = complete(&mut session.opendir(&resolved)).await?;
    while let Some(entry) = complete(&mut dir.read()).await? {
        println!("{}", serde_json::to_string(&entry)?);
    }
    complete(&mut dir.close()).await?;

    println!("{}", serde_json::to_string_pretty(&session.info())?);
    session.disconnect();
    Ok(())
}
