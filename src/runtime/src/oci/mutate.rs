//! Layer and history splicing.
//!
//! [`rebase`] swaps the base an image was built on for another one. The
//! layers the original added above its old base are kept, in order, on top
//! of the new base's layers; config history and `rootfs.diff_ids` are
//! rebuilt to match. Nothing is fetched beyond manifests and configs, and
//! the inputs are never modified.

use a3s_rebase_core::error::{OciError, Result};

use super::image::{ComposedImage, Image, Layer, ManifestTemplate};
use super::manifest::{ConfigFile, History};

/// Rebase `original` from `old_base` onto `new_base`.
///
/// Fails with `BaseMismatch` unless the old base's diff IDs are a prefix of
/// the original's.
pub async fn rebase(
    original: &dyn Image,
    old_base: &dyn Image,
    new_base: &dyn Image,
) -> Result<ComposedImage> {
    let original_manifest = original.manifest()?;
    let original_config = original.config_file().await?;
    let original_layers = original.layers().await?;
    let old_config = old_base.config_file().await?;
    let old_layers = old_base.layers().await?;
    let new_config = new_base.config_file().await?;
    let new_layers = new_base.layers().await?;

    check_prefix(&old_layers, &original_layers)?;
    let appended = &original_layers[old_layers.len()..];

    tracing::debug!(
        old_base_layers = old_layers.len(),
        new_base_layers = new_layers.len(),
        appended_layers = appended.len(),
        "Splicing layers"
    );

    let with_history = !original_config.history.is_empty() || !new_config.history.is_empty();
    let mut history = base_history(&new_config.history, new_layers.len(), with_history);
    history.extend(appended_history(
        &original_config.history,
        old_config.history.len(),
        old_layers.len(),
        appended.len(),
        with_history,
    ));

    let layers: Vec<Layer> = new_layers.iter().chain(appended.iter()).cloned().collect();

    let mut config: ConfigFile = original_config.as_ref().clone();
    config.architecture = new_config.architecture.clone();
    config.os = new_config.os.clone();
    config.os_version = new_config.os_version.clone();
    config.variant = new_config.variant.clone();
    config.history = history;
    config.rootfs.diff_ids = layers.iter().map(|l| l.diff_id().clone()).collect();

    ComposedImage::new(ManifestTemplate::from_manifest(&original_manifest), config, layers)
}

/// The old base's diff IDs must open the original's, position by position.
fn check_prefix(old_base: &[Layer], original: &[Layer]) -> Result<()> {
    for (position, old) in old_base.iter().enumerate() {
        match original.get(position) {
            Some(layer) if layer.diff_id() == old.diff_id() => {}
            Some(layer) => {
                return Err(OciError::BaseMismatch {
                    position,
                    expected: old.diff_id().to_string(),
                    found: layer.diff_id().to_string(),
                })
            }
            None => {
                return Err(OciError::BaseMismatch {
                    position,
                    expected: old.diff_id().to_string(),
                    found: "<none>".to_string(),
                })
            }
        }
    }
    Ok(())
}

/// The new base's history, padded so every base layer has an entry.
fn base_history(history: &[History], layer_count: usize, pad: bool) -> Vec<History> {
    let mut out = history.to_vec();
    if pad {
        pad_layers(&mut out, layer_count);
    }
    out
}

/// Entries of the original's history that belong above the old base.
///
/// Layer-producing entries are kept when their layer is an appended one.
/// Empty-layer entries are kept when they come after the old base's history.
fn appended_history(
    history: &[History],
    old_history_len: usize,
    old_layer_count: usize,
    appended_count: usize,
    pad: bool,
) -> Vec<History> {
    let mut out = Vec::new();
    let mut layer_position = 0;
    for (index, entry) in history.iter().enumerate() {
        let keep = if entry.empty_layer {
            index >= old_history_len
        } else {
            let keep = layer_position >= old_layer_count;
            layer_position += 1;
            keep
        };
        if keep {
            out.push(entry.clone());
        }
    }
    if pad {
        pad_layers(&mut out, appended_count);
    }
    out
}

/// Append blank entries until `history` accounts for `layer_count` layers.
fn pad_layers(history: &mut Vec<History>, layer_count: usize) {
    let recorded = history.iter().filter(|h| !h.empty_layer).count();
    if recorded < layer_count {
        history.extend(std::iter::repeat(History::default()).take(layer_count - recorded));
    } else if recorded > layer_count {
        tracing::debug!(recorded, layer_count, "History lists more layers than the image has");
    }
}
