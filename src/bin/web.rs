use anyhow::Result;
use blip_caption::web::{serve, AppState};
use blip_caption::{BlipCaptioner, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let settings = Settings::from_env()?;
    println!("🔧 Configuration loaded: running in {:?} mode", settings.deployment);

    println!("Initializing Image Caption Generator...");
    let model_dir = settings.resolved_model_dir();
    let captioner = BlipCaptioner::initialize(&settings.model_id, &model_dir).await?;
    println!("✅ Model loaded on {}", captioner.device());

    let rule = "=".repeat(50);
    println!("\n{rule}");
    println!("Starting Image Caption Generator Web Interface");
    println!("{rule}\n");

    let state = AppState::new(Box::new(captioner), settings.generation, settings.model_id.clone());
    serve(&settings.server, state).await
}
