//! Child process stream handling.
//!
//! Each session owns two reader tasks (stdout and stderr) and one writer
//! task (stdin). Readers frame raw bytes with [`codec::OutputCodec`] and
//! forward [`reader::StreamEvent`]s to the session controller; the writer
//! serializes caller input onto the child's stdin.

pub mod codec;
pub mod reader;
pub mod writer;
