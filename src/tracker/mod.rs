mod rooms;
mod server;

pub use rooms::Rooms;
pub use server::serve;
