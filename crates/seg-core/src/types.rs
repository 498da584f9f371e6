//! Plain data types shared between the data pipeline and the trainer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// How the source annotations are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelMode {
    /// Full pathology label
    Label,
    /// Normal vs abnormal
    Normal,
    /// Pixel masks
    Mask,
    /// Mass lesions
    Mass,
    /// Benign lesions
    Benign,
}

impl LabelMode {
    /// Single letter used inside model names.
    pub fn code(&self) -> char {
        match self {
            LabelMode::Label => 'l',
            LabelMode::Normal => 'b',
            LabelMode::Mask => 'm',
            _ => 'x',
        }
    }

    /// Number of classes the annotation scheme distinguishes.
    pub fn num_classes(&self) -> usize {
        match self {
            LabelMode::Label => 5,
            LabelMode::Normal => 2,
            LabelMode::Mass => 3,
            LabelMode::Benign => 3,
            LabelMode::Mask => 2,
        }
    }
}

impl Default for LabelMode {
    fn default() -> Self {
        LabelMode::Mask
    }
}

impl fmt::Display for LabelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LabelMode::Label => "label",
            LabelMode::Normal => "normal",
            LabelMode::Mask => "mask",
            LabelMode::Mass => "mass",
            LabelMode::Benign => "benign",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for LabelMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "label" => Ok(LabelMode::Label),
            "normal" => Ok(LabelMode::Normal),
            "mask" => Ok(LabelMode::Mask),
            "mass" => Ok(LabelMode::Mass),
            "benign" => Ok(LabelMode::Benign),
            other => Err(Error::InvalidArgument(format!("unknown label mode '{}'", other))),
        }
    }
}

/// What the run does after initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Train, validate every epoch, then test
    Train,
    /// Skip training and only run the final test
    Evaluate,
}

impl Default for Action {
    fn default() -> Self {
        Action::Train
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        if s == "train" {
            Action::Train
        } else {
            Action::Evaluate
        }
    }
}

/// Dataset partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Test => "test",
        }
    }
}

/// One square image with its binary mask, both row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub image: Vec<f32>,
    pub label: Vec<u8>,
    pub size: usize,
}

impl Sample {
    pub fn new(image: Vec<f32>, label: Vec<u8>, size: usize) -> Result<Self> {
        let expected = size * size;
        if image.len() != expected || label.len() != expected {
            return Err(Error::Dataset(format!(
                "sample buffers must hold {} pixels, got image {} and label {}",
                expected,
                image.len(),
                label.len()
            )));
        }
        Ok(Self { image, label, size })
    }

    /// Number of foreground pixels in the mask.
    pub fn positive_pixels(&self) -> usize {
        self.label.iter().filter(|&&v| v > 0).count()
    }
}

/// Samples stacked along a leading batch axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub images: Vec<f32>,
    pub labels: Vec<u8>,
    pub len: usize,
    pub size: usize,
}

impl Batch {
    pub fn from_samples(samples: Vec<Sample>) -> Result<Self> {
        let size = match samples.first() {
            Some(s) => s.size,
            None => return Err(Error::Dataset("cannot batch zero samples".to_string())),
        };
        let len = samples.len();
        let mut images = Vec::with_capacity(len * size * size);
        let mut labels = Vec::with_capacity(len * size * size);
        for sample in samples {
            if sample.size != size {
                return Err(Error::Dataset(format!(
                    "mixed sample sizes in batch: {} and {}",
                    size, sample.size
                )));
            }
            images.extend(sample.image);
            labels.extend(sample.label);
        }
        Ok(Self { images, labels, len, size })
    }

    /// Shape in NCHW order.
    pub fn shape(&self) -> [usize; 4] {
        [self.len, 1, self.size, self.size]
    }

    pub fn labels_f32(&self) -> Vec<f32> {
        self.labels.iter().map(|&v| if v > 0 { 1.0 } else { 0.0 }).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_codes() {
        assert_eq!(LabelMode::Label.code(), 'l');
        assert_eq!(LabelMode::Normal.code(), 'b');
        assert_eq!(LabelMode::Mask.code(), 'm');
        assert_eq!(LabelMode::Mass.code(), 'x');
        assert_eq!(LabelMode::Benign.code(), 'x');
    }

    #[test]
    fn test_label_num_classes() {
        assert_eq!(LabelMode::Label.num_classes(), 5);
        assert_eq!(LabelMode::Mask.num_classes(), 2);
        assert_eq!(LabelMode::Benign.num_classes(), 3);
    }

    #[test]
    fn test_label_parse() {
        assert_eq!("mask".parse::<LabelMode>().unwrap(), LabelMode::Mask);
        assert_eq!("MASS".parse::<LabelMode>().unwrap(), LabelMode::Mass);
        assert!("tumour".parse::<LabelMode>().is_err());
    }

    #[test]
    fn test_action_from_str() {
        assert_eq!(Action::from("train"), Action::Train);
        assert_eq!(Action::from("test"), Action::Evaluate);
    }

    #[test]
    fn test_batch_from_samples() {
        let a = Sample::new(vec![0.0; 4], vec![0, 1, 0, 0], 2).unwrap();
        let b = Sample::new(vec![1.0; 4], vec![1, 1, 0, 0], 2).unwrap();
        let batch = Batch::from_samples(vec![a, b]).unwrap();
        assert_eq!(batch.shape(), [2, 1, 2, 2]);
        assert_eq!(batch.labels, vec![0, 1, 0, 0, 1, 1, 0, 0]);
        assert_eq!(batch.images[4..], [1.0; 4]);
    }

    #[test]
    fn test_batch_rejects_mixed_sizes() {
        let a = Sample::new(vec![0.0; 4], vec![0; 4], 2).unwrap();
        let b = Sample::new(vec![0.0; 9], vec![0; 9], 3).unwrap();
        assert!(Batch::from_samples(vec![a, b]).is_err());
        assert!(Batch::from_samples(Vec::new()).is_err());
    }

    #[test]
    fn test_sample_rejects_bad_buffers() {
        assert!(Sample::new(vec![0.0; 3], vec![0; 4], 2).is_err());
    }
}
