//! One module per subcommand.

pub mod compact;
pub mod dump;
pub mod stats;
pub mod transcript;
