mod dwarf;
mod resolver;

pub use dwarf::{AddressRange, DebugInfo, FunctionSymbol};
pub use resolver::{Location, SymbolResolver, is_internal_location, simplify_path};
