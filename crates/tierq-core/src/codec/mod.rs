//! Wire codec: versioned task envelopes and ledger records.

mod serializer;
mod validate;

pub use self::serializer::{TaskSerializer, WireFormat};
pub use self::validate::validate_task_data;
