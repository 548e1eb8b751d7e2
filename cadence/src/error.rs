#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("image encoding error")]
    Image(#[from] image::ImageError),
}
