//! Show the plugin registry and the effective configuration.

use montage_common::config::{config_file_path, AppConfig};
use montage_render_engine::PluginRegistry;

pub fn run(config: &AppConfig) -> anyhow::Result<()> {
    println!("Montage Check");
    println!("{}", "=".repeat(50));

    let path = config_file_path();
    if path.exists() {
        println!("[OK] Config: {}", path.display());
    } else {
        println!("[--] Config: {} (not found, using defaults)", path.display());
    }
    println!("{}", serde_json::to_string_pretty(config)?);
    println!();

    let registry = PluginRegistry::with_builtins();
    println!("Plugins:");
    for d in registry.descriptors() {
        let mut media = Vec::new();
        if d.audio {
            media.push("audio");
        }
        if d.video {
            media.push("video");
        }
        if d.synthesis {
            media.push("synthesis");
        }
        if d.multichannel {
            media.push("multichannel");
        }
        println!("  {:<16} {:<32} {}", d.name, media.join(","), d.description);
    }

    Ok(())
}
