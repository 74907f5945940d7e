//! Full-session example: connect, open a tab, extract the indexed view.

use webpilot_browser::{BrowserSession, SessionConfig};
use webpilot_dom::DomSerializer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt::init();

    let config = SessionConfig {
        cdp_url: "ws://localhost:9222/devtools/browser".to_string(),
        ..Default::default()
    };
    let session = BrowserSession::new(config);
    session.start().await?;

    let target_id = session
        .new_tab(Some("https://example.com".to_string()))
        .await?;
    println!("Opened tab: {}", target_id);

    session.navigate("https://example.com").await?;

    let snapshot = session.extract_dom_tree(&target_id).await?;
    println!(
        "Extracted {} nodes, {} interactive",
        snapshot.arena.len(),
        snapshot.selector_map.len()
    );

    let text = DomSerializer::new().serialize(&snapshot.arena, &snapshot.selector_map)?;
    println!("{}", text);

    session.stop().await?;
    Ok(())
}
