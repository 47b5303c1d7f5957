mod arch;

pub use arch::architecture;
pub use arch::Architecture;
