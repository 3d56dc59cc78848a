//! Passphrase acquisition for unlocking the key store

use crate::error::{ErrorCategory, ErrorKind, Result, SealnoteError};
use std::io::{self, BufRead, IsTerminal, Write};
use zeroize::Zeroizing;

/// Source of the passphrase handed to [`crate::keystore::KeyStore::unlock`].
pub trait PassphraseReader {
    /// Read a passphrase as arbitrary bytes (not necessarily UTF-8)
    ///
    /// Returns the passphrase wrapped in `Zeroizing` to ensure it is securely
    /// wiped from memory when dropped.
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>>;
}

/// Returns a fixed passphrase (for tests and embedding callers)
pub struct ConstantPassphraseReader {
    passphrase: Zeroizing<Vec<u8>>,
}

impl ConstantPassphraseReader {
    pub fn new(passphrase: impl Into<Vec<u8>>) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase.into()),
        }
    }
}

impl PassphraseReader for ConstantPassphraseReader {
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        Ok(self.passphrase.clone())
    }
}

/// Reads a single line from any buffered source, typically stdin.
///
/// One trailing `\n` (or `\r\n`) is stripped; everything else, including
/// non-UTF-8 bytes and inner whitespace, is kept verbatim.
pub struct LinePassphraseReader<R> {
    reader: R,
}

impl<R: BufRead> LinePassphraseReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead> PassphraseReader for LinePassphraseReader<R> {
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        let mut line = Zeroizing::new(Vec::new());
        self.reader.read_until(b'\n', &mut line).map_err(|e| {
            SealnoteError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                format!("error reading passphrase: {}", e),
                e,
            )
        })?;
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        Ok(line)
    }
}

/// Reads passphrase from terminal with no echo
///
/// With confirmation enabled the passphrase is requested twice and the two
/// entries must match; used when a new key store is created.
pub struct TerminalPassphraseReader {
    confirm: bool,
}

impl TerminalPassphraseReader {
    pub fn new() -> Self {
        Self { confirm: false }
    }

    pub fn confirming() -> Self {
        Self { confirm: true }
    }

    fn prompt(label: &str) -> Result<Zeroizing<Vec<u8>>> {
        let mut stderr = io::stderr();
        stderr
            .write_all(label.as_bytes())
            .and_then(|_| stderr.flush())
            .map_err(|e| {
                SealnoteError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    format!("failed to write prompt: {}", e),
                    e,
                )
            })?;

        // rpassword hands back a plain String; move it straight into zeroizing storage
        let passphrase = rpassword::read_password().map_err(|e| {
            SealnoteError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::PassphraseUnavailable,
                format!("failure reading passphrase: {}", e),
                e,
            )
        })?;
        Ok(Zeroizing::new(passphrase.into_bytes()))
    }
}

impl Default for TerminalPassphraseReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PassphraseReader for TerminalPassphraseReader {
    /// Note: Terminal input is limited to UTF-8 due to rpassword library constraints.
    /// For non-UTF-8 passphrases, use --passphrase-stdin instead.
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        if !io::stdin().is_terminal() {
            return Err(SealnoteError::with_kind(
                ErrorCategory::User,
                ErrorKind::PassphraseUnavailable,
                "cannot read passphrase from terminal - stdin is not a terminal",
            ));
        }

        let passphrase = Self::prompt("Passphrase (sealnote): ")?;
        if self.confirm {
            let again = Self::prompt("Repeat passphrase (sealnote): ")?;
            if *again != *passphrase {
                return Err(SealnoteError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::PassphraseUnavailable,
                    "passphrases do not match",
                ));
            }
        }
        Ok(passphrase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_reader() {
        let mut reader = ConstantPassphraseReader::new(b"test123".to_vec());
        assert_eq!(&*reader.read_passphrase().unwrap(), b"test123");
        assert_eq!(&*reader.read_passphrase().unwrap(), b"test123");
    }

    #[test]
    fn test_line_reader_strips_single_newline() {
        let mut reader = LinePassphraseReader::new(&b"correct horse\n"[..]);
        assert_eq!(&*reader.read_passphrase().unwrap(), b"correct horse");

        let mut reader = LinePassphraseReader::new(&b"windows\r\n"[..]);
        assert_eq!(&*reader.read_passphrase().unwrap(), b"windows");

        let mut reader = LinePassphraseReader::new(&b"spaces kept  \n\n"[..]);
        assert_eq!(&*reader.read_passphrase().unwrap(), b"spaces kept  ");
    }

    #[test]
    fn test_line_reader_without_newline() {
        let mut reader = LinePassphraseReader::new(&b"no newline"[..]);
        assert_eq!(&*reader.read_passphrase().unwrap(), b"no newline");
    }

    #[test]
    fn test_line_reader_empty() {
        let mut reader = LinePassphraseReader::new(&b""[..]);
        assert_eq!(&*reader.read_passphrase().unwrap(), b"");
    }

    /// Passphrases piped on stdin may contain bytes that are not UTF-8.
    #[test]
    fn test_line_reader_non_utf8() {
        let data: &[u8] = &[0xff, 0xfe, 0x00, 0x01, b'\n'];
        let mut reader = LinePassphraseReader::new(data);
        assert_eq!(&*reader.read_passphrase().unwrap(), &[0xff, 0xfe, 0x00, 0x01]);
    }

    /// Tests the terminal reader. This is ignored by default and must be run
    /// explicitly and with human input:
    ///
    /// cargo test test_terminal_reader_interactive -- --ignored --nocapture
    #[test]
    #[ignore]
    fn test_terminal_reader_interactive() {
        let mut reader = TerminalPassphraseReader::confirming();
        println!("\nPlease enter a test passphrase twice:");
        let passphrase = reader.read_passphrase().unwrap();
        assert!(!passphrase.is_empty(), "Expected non-empty passphrase");
    }
}
