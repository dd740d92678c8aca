pub mod check;
pub mod info;
pub mod play;
pub mod render;

use std::path::Path;
use std::sync::Arc;

use montage_common::config::AppConfig;
use montage_render_engine::{AssetCache, GeneratorOpener, PluginRegistry};
use montage_timeline::Edl;

pub(crate) fn load_edl(path: &Path) -> anyhow::Result<Arc<Edl>> {
    let edl = Edl::load(path).map_err(|e| anyhow::anyhow!("Failed to load timeline: {e}"))?;
    Ok(Arc::new(edl))
}

/// Shared asset cache and plugin registry for one command.
pub(crate) fn collaborators(config: &AppConfig) -> (Arc<AssetCache>, Arc<PluginRegistry>) {
    let cache = AssetCache::new(Arc::new(GeneratorOpener), config.cache.max_bytes);
    (Arc::new(cache), Arc::new(PluginRegistry::with_builtins()))
}
