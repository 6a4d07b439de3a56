//! Training plugins compiled into the service.

pub mod emotion_recognition;
pub mod example;

use std::sync::Arc;

use chimp_training::{CategorySet, TrainingPlugin};

pub use emotion_recognition::EmotionRecognitionPlugin;
pub use example::ExamplePlugin;

/// Every built-in plugin, in registration order.
pub fn builtin_plugins(categories: &CategorySet) -> Vec<Arc<dyn TrainingPlugin>> {
    vec![Arc::new(EmotionRecognitionPlugin::new(categories.clone())), Arc::new(ExamplePlugin)]
}
