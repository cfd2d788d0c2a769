//! Re-encoding text files in place.

use std::io;
use std::path::Path;
use std::sync::Arc;

use hauler_core::{ConvertData, EngineError, EolMode, Operation};
use tracing::{debug, warn};

use crate::context::{RunContext, StepOutcome};
use crate::decision::{ErrorCategory, Resolution};
use crate::fs::{disk_full, read_full_at, write_full_at, FileHandle, FileSystem, OpenMode};
use crate::move_op::temp_sibling;

/// Streaming byte translation with line-ending normalisation.
///
/// A carriage return at the end of one chunk is held back until the next
/// chunk shows whether a line feed follows it.
#[derive(Debug)]
pub struct LineConverter<'a> {
    data: &'a ConvertData,
    pending_cr: bool,
}

impl<'a> LineConverter<'a> {
    pub fn new(data: &'a ConvertData) -> Self {
        Self {
            data,
            pending_cr: false,
        }
    }

    /// Convert `input`, appending to `out`.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) {
        if self.data.eol == EolMode::Keep {
            out.extend(input.iter().map(|&b| self.data.translate(b)));
            return;
        }
        let eol = self.data.eol.bytes();
        let mut bytes = input.iter().copied().peekable();
        if self.pending_cr {
            self.pending_cr = false;
            if bytes.peek() == Some(&b'\n') {
                bytes.next();
            }
            out.extend_from_slice(eol);
        }
        while let Some(byte) = bytes.next() {
            match byte {
                b'\r' => match bytes.peek() {
                    Some(b'\n') => {
                        bytes.next();
                        out.extend_from_slice(eol);
                    }
                    Some(_) => out.extend_from_slice(eol),
                    None => self.pending_cr = true,
                },
                b'\n' => out.extend_from_slice(eol),
                other => out.push(self.data.translate(other)),
            }
        }
    }

    /// Flush a held-back carriage return.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if self.pending_cr {
            self.pending_cr = false;
            out.extend_from_slice(self.data.eol.bytes());
        }
    }
}

#[derive(Debug)]
enum ConvertFailure {
    Io(io::Error),
    Cancelled,
}

impl From<io::Error> for ConvertFailure {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Write the converted content of `src` to `dst`; returns source bytes read.
async fn convert_into(
    ctx: &mut RunContext,
    data: &ConvertData,
    src: Arc<dyn FileHandle>,
    dst: Arc<dyn FileHandle>,
    temp: &Path,
) -> Result<u64, ConvertFailure> {
    let buffer = ctx.config.operation_buffer;
    let mut input = vec![0; buffer];
    let mut output = Vec::with_capacity(buffer + buffer / 2);
    let mut converter = LineConverter::new(data);
    let mut read_offset = 0u64;
    let mut write_offset = 0u64;

    loop {
        if ctx.control.checkpoint().await.is_err() {
            return Err(ConvertFailure::Cancelled);
        }
        let read = read_full_at(src.as_ref(), &mut input, read_offset)?;
        output.clear();
        if read == 0 {
            converter.finish(&mut output);
        } else {
            converter.feed(&input[..read], &mut output);
        }
        if !output.is_empty() {
            if write_full_at(dst.as_ref(), &output, write_offset)? < output.len() {
                return Err(disk_full(temp).into());
            }
            write_offset += output.len() as u64;
        }
        if read == 0 {
            break;
        }
        read_offset += read as u64;
        let sleep = ctx
            .status
            .add_bytes(read as u64, false, buffer, None, buffer);
        ctx.report_progress(false);
        ctx.throttle(sleep).await;
    }
    dst.flush()?;
    Ok(read_offset)
}

/// Swap the converted temporary file in place of `source`.
fn replace_source(fs: &dyn FileSystem, temp: &Path, source: &Path) -> io::Result<()> {
    let meta = fs.metadata(source)?;
    if meta.readonly {
        fs.set_readonly(source, false)?;
    }
    fs.rename(temp, source)?;
    fs.set_times(source, meta.times())?;
    if meta.readonly {
        fs.set_readonly(source, true)?;
    }
    Ok(())
}

/// Re-encode `op.source` through the script's code table and line-ending
/// policy.
pub(crate) async fn convert_file(
    ctx: &mut RunContext,
    op: &Operation,
) -> Result<StepOutcome, EngineError> {
    let source = op.source.as_path();
    let data = ctx.convert.clone().unwrap_or_default();
    let (start_transferred, start_progress) = ctx.status.transferred_and_progress();

    loop {
        let temp = temp_sibling(ctx.fs.as_ref(), source);
        let opened = ctx
            .fs
            .open_read(source)
            .and_then(|src| Ok((src, ctx.fs.open_write(&temp, OpenMode::CreateNew)?)));
        let result = match opened {
            Ok((src, dst)) => convert_into(ctx, &data, src, dst, &temp).await,
            Err(e) => Err(ConvertFailure::Io(e)),
        };
        let result = result.and_then(|read| {
            replace_source(ctx.fs.as_ref(), &temp, source)?;
            Ok(read)
        });

        let error = match result {
            Ok(read) => {
                debug!(path = %source.display(), bytes = read, "converted");
                return Ok(StepOutcome::Done);
            }
            Err(ConvertFailure::Cancelled) => {
                discard(ctx.fs.as_ref(), &temp);
                return Err(EngineError::Cancelled);
            }
            Err(ConvertFailure::Io(e)) => e,
        };

        discard(ctx.fs.as_ref(), &temp);
        ctx.status.rollback_to(start_transferred, start_progress);
        match ctx
            .ask(ErrorCategory::Convert, Some(source), None, &error)
            .await?
        {
            Resolution::Retry => continue,
            _ => return Ok(ctx.skipped(source, &error)),
        }
    }
}

fn discard(fs: &dyn FileSystem, temp: &Path) {
    if !fs.exists(temp) {
        return;
    }
    if let Err(e) = fs.remove_file(temp) {
        warn!(path = %temp.display(), error = %e, "cannot remove temporary file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert_all(data: &ConvertData, chunks: &[&[u8]]) -> Vec<u8> {
        let mut converter = LineConverter::new(data);
        let mut out = Vec::new();
        for chunk in chunks {
            converter.feed(chunk, &mut out);
        }
        converter.finish(&mut out);
        out
    }

    #[test]
    fn test_crlf_to_lf() {
        let data = ConvertData::identity(EolMode::Lf);
        assert_eq!(convert_all(&data, &[b"a\r\nb\rc\n"]), b"a\nb\nc\n");
    }

    #[test]
    fn test_cr_split_across_chunks() {
        let data = ConvertData::identity(EolMode::Crlf);
        assert_eq!(convert_all(&data, &[b"a\r", b"\nb"]), b"a\r\nb");
        assert_eq!(convert_all(&data, &[b"a\r", b"b"]), b"a\r\nb");
        assert_eq!(convert_all(&data, &[b"a\r"]), b"a\r\n");
    }

    #[test]
    fn test_keep_only_translates() {
        let mut data = ConvertData::identity(EolMode::Keep);
        data.code_table[b'e' as usize] = b'E';
        assert_eq!(convert_all(&data, &[b"line\r\n"]), b"linE\r\n");
    }
}
