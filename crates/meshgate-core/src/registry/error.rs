//! Registry errors

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No instance with this identity is known locally
    #[error("Instance {name}/{id} is not registered")]
    InstanceNotFound { name: String, id: String },

    /// A bus event could not be decoded
    #[error("Invalid {topic} event: {message}")]
    InvalidEvent { topic: String, message: String },
}

impl RegistryError {
    pub fn not_found(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self::InstanceNotFound {
            name: name.into(),
            id: id.into(),
        }
    }

    pub fn invalid_event(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidEvent {
            topic: topic.into(),
            message: message.into(),
        }
    }
}
