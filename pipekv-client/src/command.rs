//! # Commands
//!
//! A `Command` is a name plus ordered, binary-safe arguments. It is built once,
//! queued, and only ever read afterwards.

use bytes::Bytes;

use crate::resp::encode_command;

/// One queued request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: Bytes,
    args: Vec<Bytes>,
}

impl Command {
    /// Starts a command with no arguments. The name is sent uppercased.
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Command {
            name: Bytes::copy_from_slice(name.as_ref()),
            args: Vec::new(),
        }
    }

    /// Appends a raw argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Appends an already shared buffer without copying it.
    pub fn arg_bytes(mut self, arg: Bytes) -> Self {
        self.args.push(arg);
        self
    }

    /// Appends an integer argument in decimal ASCII.
    pub fn int_arg(self, value: i64) -> Self {
        let mut digits = itoa::Buffer::new();
        let formatted = digits.format(value);
        self.arg(formatted)
    }

    /// Command name as given to `new`.
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Arguments in send order.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Appends this command's wire form to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        encode_command(&self.name, &self.args, out);
    }

    /// Upper bound of the encoded size, used to size the batch buffer.
    pub(crate) fn encoded_len_hint(&self) -> usize {
        // '*'/'$' + up to 20 digits + CRLF per header, plus CRLF after each payload.
        let frame = 1 + 20 + 2;
        frame
            + frame
            + self.name.len()
            + 2
            + self.args.iter().map(|arg| frame + arg.len() + 2).sum::<usize>()
    }
}
