mod persona_error;

pub use persona_error::{PersonaError, PersonaErrorKind};
