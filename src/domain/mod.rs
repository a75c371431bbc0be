pub mod records;
pub mod redemption;

pub use records::*;
pub use redemption::*;
