//! Example: log in to an Argo CD server and print the session token length
//!
//! Run with: cargo run --example session -p argocd-rs -- https://1.2.3.4 admin <password>

use argocd_rs::ArgoClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install the ring crypto provider for rustls
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let mut args = std::env::args().skip(1);
    let host = args.next().ok_or("usage: session <host> <username> <password>")?;
    let username = args.next().unwrap_or_else(|| "admin".to_string());
    let password = args.next().ok_or("missing password")?;

    println!("Connecting to {}...", host);
    let client = ArgoClient::new(&host)?;
    let token = client.create_session(&username, &password).await?;

    println!("{:-<60}", "");
    println!("User:   {}", username);
    println!("Token:  {} bytes", token.len());
    println!("{:-<60}", "");

    Ok(())
}
