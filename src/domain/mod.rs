pub mod lesson;
pub mod subscription;
pub mod user;

pub use lesson::*;
pub use subscription::*;
pub use user::*;
