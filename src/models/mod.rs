pub mod enums;
pub mod patient;
pub mod findings;
pub mod protocol;
pub mod results;
pub mod run;

pub use enums::*;
pub use patient::*;
pub use findings::*;
pub use protocol::*;
pub use results::*;
pub use run::*;
