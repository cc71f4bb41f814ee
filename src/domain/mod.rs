pub mod intent;
pub mod lifecycle;
pub mod order;
pub mod reservation;
pub mod state;

pub use intent::*;
pub use lifecycle::*;
pub use order::*;
pub use reservation::*;
pub use state::*;
