//! Basic CDP example - connecting and listing targets.

use std::sync::Arc;
use webpilot_browser::cdp::CDPClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cdp_url = "ws://localhost:9222/devtools/browser";
    println!("Connecting to browser at: {}", cdp_url);

    let client = CDPClient::connect(cdp_url).await?;
    println!("Connected!");

    let version = client
        .send_request("Browser.getVersion", None, None)
        .await?;
    println!("Browser version: {}", version);

    let targets = client.send_request("Target.getTargets", None, None).await?;
    println!("Targets: {}", targets);

    // Watch targets come and go for a moment.
    client.subscribe(
        "Target.targetCreated",
        Arc::new(move |event| {
            println!("Target created: {:?}", event.params);
        }),
    );
    tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;

    client.close().await?;
    println!("Disconnected");

    Ok(())
}
