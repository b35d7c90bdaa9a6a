mod bitmap;

pub use bitmap::Bitmap;
