// Collaborators at the engine boundary: where definitions come from and where results go

pub mod definition;
pub mod results;

pub use definition::{load_file, DefinitionSource, FilesystemDefinitionSource};
pub use results::{JsonlResultSink, MemoryResultSink, ResultSink};
