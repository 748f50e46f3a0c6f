use std::time::Instant;

use anyhow::Result;
use blip_caption::batch::{install_interrupt_handler, BatchSession};
use blip_caption::{create_caption_client, Settings};

fn main() -> Result<()> {
    env_logger::init();

    println!("🚀 Image Caption Generator - BLIP");
    install_interrupt_handler()?;

    let settings = Settings::from_env()?;

    println!("\n[1/3] Initializing the caption generator ({})...", settings.model_id);
    let init_start_time = Instant::now();
    let rt = tokio::runtime::Runtime::new()?;
    let mut client = match rt.block_on(create_caption_client(&settings)) {
        Ok(client) => client,
        Err(e) => {
            println!("❌ Failed to load model: {}", e);
            return Err(e.into());
        }
    };
    println!(
        "✅ Model loaded in {:.2}s on {}",
        init_start_time.elapsed().as_secs_f32(),
        client.device().map(|d| d.to_string()).unwrap_or_default()
    );

    println!("\n[2/3] Ready to generate captions!");

    // stdout stays unlocked between writes so the Ctrl-C handler can print
    let stdin = std::io::stdin();
    let result = BatchSession::new(&mut client, settings.generation, stdin.lock(), std::io::stdout()).run();

    if let Err(e) = result {
        println!("\n\n❌ An error occurred: {}", e);
        println!("Please check your setup and try again.");
    }

    client.cleanup();
    Ok(())
}
