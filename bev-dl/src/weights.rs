//! Parameter checkpoints and encoder freezing.

use crate::{common::*, model::EncoderInit};

/// Name of the variable namespace holding the encoder.
pub const ENCODER_NAMESPACE: &str = "encoder";

fn is_encoder_variable(name: &str) -> bool {
    name.split('.').any(|component| component == ENCODER_NAMESPACE)
}

/// Saves every variable of the store to a checkpoint file.
pub fn save_weights<P>(vs: &nn::VarStore, path: P) -> Result<()>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    vs.save(path)
        .with_context(|| format!("failed to save weights to '{}'", path.display()))?;
    info!("saved weights to '{}'", path.display());
    Ok(())
}

/// Loads a full checkpoint and freezes the encoder.
pub fn load_weights<P>(vs: &mut nn::VarStore, path: P) -> Result<()>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    vs.load(path)
        .with_context(|| format!("failed to load weights from '{}'", path.display()))?;
    info!("loaded weights from '{}'", path.display());
    freeze_encoder(vs);
    Ok(())
}

/// Disables gradients of every variable in the encoder namespace and
/// returns the number of frozen variables.
pub fn freeze_encoder(vs: &nn::VarStore) -> usize {
    let mut count = 0;
    for (_, tensor) in vs
        .variables()
        .into_iter()
        .filter(|(name, _)| is_encoder_variable(name))
    {
        let _ = tensor.set_requires_grad(false);
        count += 1;
    }
    info!("froze {} encoder variables", count);
    count
}

/// Copies a standalone pretext encoder checkpoint into the encoder namespace
/// of the store, then freezes the encoder.
pub fn load_encoder_weights<P>(vs: &nn::VarStore, path: P, init: &EncoderInit) -> Result<()>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();

    let mut pretext_vs = nn::VarStore::new(Device::Cpu);
    let _encoder = init.clone().build(pretext_vs.root())?;
    pretext_vs
        .load(path)
        .with_context(|| format!("failed to load encoder weights from '{}'", path.display()))?;

    let variables = vs.variables();
    let pretext_variables = pretext_vs.variables();

    tch::no_grad(|| -> Result<()> {
        for (name, source) in pretext_variables.iter().sorted_by_key(|(name, _)| *name) {
            let suffix = format!("{}.{}", ENCODER_NAMESPACE, name);
            let (target_name, target) = variables
                .iter()
                .find(|(target_name, _)| {
                    *target_name == &suffix || target_name.ends_with(&format!(".{}", suffix))
                })
                .ok_or_else(|| format_err!("the model has no encoder variable '{}'", name))?;
            ensure!(
                source.size() == target.size(),
                "shape mismatch for '{}', checkpoint has {:?} but model has {:?}",
                target_name,
                source.size(),
                target.size()
            );
            target.shallow_clone().copy_(source);
        }
        Ok(())
    })?;

    info!(
        "copied {} encoder variables from '{}'",
        pretext_variables.len(),
        path.display()
    );
    freeze_encoder(vs);
    Ok(())
}
