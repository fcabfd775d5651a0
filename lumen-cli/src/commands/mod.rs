pub mod analyze;
pub mod hash;
pub mod lookup;
pub mod unlock;
