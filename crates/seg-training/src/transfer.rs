//! Weight transfer between architecture versions.
//!
//! A [`TransferMap`] lists, for each `(source version, target version)`
//! pair, the layers that must not be copied. Everything else is copied from
//! the source network and has to match in name and kernel shape; any
//! mismatch is an [`Error::Transfer`].

use burn::tensor::backend::Backend;
use seg_core::{Error, Result, ARCHITECTURE_VERSION};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

use crate::architecture::ArchitectureSpec;
use crate::model::{LayerMut, LayerRef, SegNet};

/// Layers reinitialized when transferring into the current architecture:
/// the last two dilated convs and the whole decoder.
pub const DEFAULT_EXCLUDED_LAYERS: [&str; 9] = [
    "conv5.1",
    "conv5.2",
    "up_conv2",
    "up_conv4",
    "up_conv6",
    "up_conv7",
    "upsample_4",
    "upsample_5",
    "logits",
];

/// Excluded layers per `(source, target)` architecture version
#[derive(Debug, Clone, Default)]
pub struct TransferMap {
    exclusions: HashMap<(String, String), BTreeSet<String>>,
}

impl TransferMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mapping with the known transfer into the current architecture.
    pub fn with_defaults() -> Self {
        let mut map = Self::new();
        map.insert(ARCHITECTURE_VERSION, ARCHITECTURE_VERSION, DEFAULT_EXCLUDED_LAYERS);
        map
    }

    pub fn insert<I, S>(&mut self, source: &str, target: &str, excluded: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclusions.insert(
            (source.to_string(), target.to_string()),
            excluded.into_iter().map(Into::into).collect(),
        );
    }

    pub fn excluded(&self, source: &str, target: &str) -> Option<&BTreeSet<String>> {
        self.exclusions.get(&(source.to_string(), target.to_string()))
    }

    /// Checks the mapping against both architectures and lists which layers
    /// get copied.
    pub fn plan(&self, source: &ArchitectureSpec, target: &ArchitectureSpec) -> Result<TransferPlan> {
        let excluded = self.excluded(&source.version, &target.version).ok_or_else(|| {
            Error::Transfer(format!(
                "no transfer mapping from architecture {} to {}",
                source.version, target.version
            ))
        })?;

        let unknown: Vec<&str> = excluded
            .iter()
            .filter(|name| !target.contains_layer(name) && !source.contains_layer(name))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(Error::Transfer(format!(
                "excluded layers not present in either architecture: {}",
                unknown.join(", ")
            )));
        }

        let mut copied = Vec::new();
        let mut skipped = Vec::new();
        for (name, shape) in target.kernel_shapes() {
            if excluded.contains(&name) {
                skipped.push(name);
                continue;
            }
            match source.kernel_shape(&name) {
                None => {
                    return Err(Error::Transfer(format!(
                        "layer {} is missing from source architecture {}",
                        name, source.version
                    )))
                }
                Some(found) if found != shape => {
                    return Err(Error::Transfer(format!(
                        "layer {} has kernel shape {:?} in the source but {:?} in the target",
                        name, found, shape
                    )))
                }
                Some(_) => copied.push(name),
            }
        }

        Ok(TransferPlan { copied, skipped })
    }
}

/// Layers a transfer copies and layers it leaves at their initial values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub copied: Vec<String>,
    pub skipped: Vec<String>,
}

impl TransferPlan {
    /// Copies every planned layer from `source` into `target`.
    pub fn apply<B: Backend>(&self, source: &SegNet<B>, mut target: SegNet<B>) -> Result<SegNet<B>> {
        for name in &self.copied {
            let from = source
                .layer(name)
                .ok_or_else(|| Error::Transfer(format!("source network has no layer {}", name)))?;
            let to = target
                .layer_mut(name)
                .ok_or_else(|| Error::Transfer(format!("target network has no layer {}", name)))?;
            match (to, from) {
                (LayerMut::Conv(to), LayerRef::Conv(from)) => {
                    if to.conv.weight.val().dims() != from.conv.weight.val().dims() {
                        return Err(Error::Transfer(format!("kernel shape mismatch in layer {}", name)));
                    }
                    *to = from.clone();
                }
                (LayerMut::Transpose(to), LayerRef::Transpose(from)) => {
                    if to.conv.weight.val().dims() != from.conv.weight.val().dims() {
                        return Err(Error::Transfer(format!("kernel shape mismatch in layer {}", name)));
                    }
                    *to = from.clone();
                }
                _ => return Err(Error::Transfer(format!("layer {} changes kind between architectures", name))),
            }
            debug!("Transferred layer {}", name);
        }
        info!(
            "Transferred {} layers, reinitialized {}: {}",
            self.copied.len(),
            self.skipped.len(),
            self.skipped.join(", ")
        );
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::{ConvSpec, DecoderStep};
    use crate::model::test_support::small_config;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_default_plan() {
        let arch = ArchitectureSpec::v3_9_3_01();
        let plan = TransferMap::with_defaults().plan(&arch, &arch).unwrap();
        assert_eq!(plan.skipped.len(), DEFAULT_EXCLUDED_LAYERS.len());
        assert_eq!(plan.copied.len(), arch.layer_names().len() - DEFAULT_EXCLUDED_LAYERS.len());
        assert!(plan.copied.iter().any(|l| l == "fc_1"));
        assert!(plan.copied.iter().any(|l| l == "up_conv9"));
        assert!(!plan.copied.iter().any(|l| l == "logits"));
    }

    #[test]
    fn test_unknown_excluded_layer_fails() {
        let arch = ArchitectureSpec::v3_9_3_01();
        let mut map = TransferMap::new();
        map.insert(&arch.version, &arch.version, ["logits", "bottleneck_5.1"]);
        let err = map.plan(&arch, &arch).unwrap_err();
        assert!(matches!(err, Error::Transfer(ref msg) if msg.contains("bottleneck_5.1")));
    }

    #[test]
    fn test_unmapped_versions_fail() {
        let source = ArchitectureSpec {
            version: "3.8.0.00".to_string(),
            ..ArchitectureSpec::v3_9_3_01()
        };
        let target = ArchitectureSpec::v3_9_3_01();
        assert!(matches!(TransferMap::with_defaults().plan(&source, &target), Err(Error::Transfer(_))));
    }

    #[test]
    fn test_shape_mismatch_fails() {
        let target = ArchitectureSpec::v3_9_3_01();
        let mut source = target.clone();
        source.decoder[1] = DecoderStep::Conv(ConvSpec::new("up_conv2", 384, 121435));
        let mut map = TransferMap::new();
        map.insert(&source.version, &target.version, ["logits"]);
        let err = map.plan(&source, &target).unwrap_err();
        assert!(matches!(err, Error::Transfer(ref msg) if msg.contains("up_conv2")));
    }

    #[test]
    fn test_missing_source_layer_fails() {
        let target = ArchitectureSpec::v3_9_3_01();
        let mut source = target.clone();
        source.stages[4].convs.pop();
        let mut map = TransferMap::new();
        map.insert(&source.version, &target.version, Vec::<String>::new());
        let err = map.plan(&source, &target).unwrap_err();
        assert!(matches!(err, Error::Transfer(ref msg) if msg.contains("conv4.2")));
    }

    #[test]
    fn test_apply_copies_kept_layers_only() {
        let device = Default::default();
        let config = small_config();
        let arch = config.architecture.clone();

        let mut source = config.init::<TestBackend>(&device).unwrap();
        // make every source kernel distinguishable from a fresh init
        for name in arch.layer_names() {
            if let Some(LayerMut::Conv(block)) = source.layer_mut(&name) {
                block.conv.weight = burn::module::Param::from_tensor(block.conv.weight.val().add_scalar(1.0));
            }
        }
        let target = config.init::<TestBackend>(&device).unwrap();
        let fresh = config.init::<TestBackend>(&device).unwrap();

        let mut map = TransferMap::new();
        map.insert(&arch.version, &arch.version, ["conv5.1", "logits"]);
        let plan = map.plan(&arch, &arch).unwrap();
        let moved = plan.apply(&source, target).unwrap();

        let kernel = |m: &SegNet<TestBackend>, n: &str| m.layer(n).unwrap().kernel().into_data();
        assert_eq!(kernel(&moved, "conv0.1"), kernel(&source, "conv0.1"));
        assert_eq!(kernel(&moved, "fc_1"), kernel(&source, "fc_1"));
        assert_eq!(kernel(&moved, "conv5.1"), kernel(&fresh, "conv5.1"));
        assert_eq!(kernel(&moved, "logits"), kernel(&fresh, "logits"));
    }
}
