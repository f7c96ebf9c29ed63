pub mod intent;
pub mod memory;
pub mod record;
