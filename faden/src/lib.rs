mod capsule;
mod globals;
mod heap;
mod interning;
mod object;
mod process;
mod registry;
mod scheduler;
mod semispace;
mod value;
mod vm;

pub use capsule::*;
pub use globals::*;
pub use heap::*;
pub use interning::*;
pub use object::*;
pub use process::*;
pub use registry::*;
pub use scheduler::*;
pub use semispace::*;
pub use value::*;
pub use vm::*;
