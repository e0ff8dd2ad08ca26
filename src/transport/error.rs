use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,

    #[error("Subscribe error: {0}")]
    Subscribe(String),

    #[error("Publish error: {0}")]
    Publish(String),
}
