//! Saving and loading module parameters.
//!
//! The file is a sequence of records, one per parameter in
//! [`Module::parameters`] order. Each record is the element count as a
//! native-endian `usize`, followed by the elements' native-endian bytes at
//! the parameter's dtype width. There is no header; the layout is only
//! portable between machines with the same word size and byte order.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::mem::size_of;
use std::path::Path;

use ad_tensor::{Result, TensorError};
use log::debug;

use crate::module::Module;

/// Write every parameter of `module` to `path`, replacing the file.
pub fn save<M: Module + ?Sized>(module: &M, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut writer = BufWriter::new(File::create(path)?);
    let count = write_parameters(module, &mut writer)?;
    writer.flush()?;
    debug!("saved {} parameters to {}", count, path.display());
    Ok(())
}

/// Overwrite every parameter of `module` with the records in `path`.
///
/// Each record's element count must equal the live parameter's. Parameters
/// before a failing record have already been overwritten.
pub fn load<M: Module + ?Sized>(module: &mut M, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let count = read_parameters(module, &mut reader)?;
    debug!("loaded {} parameters from {}", count, path.display());
    Ok(())
}

/// Stream form of [`save`]. Returns the number of records written.
pub fn write_parameters<M: Module + ?Sized, W: Write>(module: &M, writer: &mut W) -> Result<usize> {
    let params = module.parameters();
    for param in &params {
        let value = param.value();
        writer.write_all(&value.numel().to_ne_bytes())?;
        writer.write_all(&value.to_ne_bytes()?)?;
    }
    Ok(params.len())
}

/// Stream form of [`load`]. Returns the number of records read.
pub fn read_parameters<M: Module + ?Sized, R: Read>(module: &mut M, reader: &mut R) -> Result<usize> {
    let params = module.parameters();
    for param in &params {
        let mut size = [0u8; size_of::<usize>()];
        reader.read_exact(&mut size)?;
        let found = usize::from_ne_bytes(size);

        let mut value = param.value_mut();
        let expected = value.numel();
        if found != expected {
            return Err(TensorError::ParameterSize { expected, found });
        }
        let mut bytes = vec![0u8; expected * value.dtype().size()];
        reader.read_exact(&mut bytes)?;
        value.copy_from_ne_bytes(&bytes)?;
    }
    Ok(params.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Linear;
    use std::io::{Cursor, ErrorKind};

    #[test]
    fn test_record_layout() {
        let layer = Linear::new(2, 3).unwrap();
        let mut bytes = Vec::new();
        assert_eq!(write_parameters(&layer, &mut bytes).unwrap(), 2);

        let word = size_of::<usize>();
        assert_eq!(bytes.len(), word + 6 * 4 + word + 3 * 4);
        assert_eq!(usize::from_ne_bytes(bytes[..word].try_into().unwrap()), 6);
        let second = word + 24;
        assert_eq!(
            usize::from_ne_bytes(bytes[second..second + word].try_into().unwrap()),
            3
        );
    }

    #[test]
    fn test_stream_round_trip() {
        let source = Linear::new(2, 2).unwrap();
        let mut target = Linear::new(2, 2).unwrap();
        let mut bytes = Vec::new();
        write_parameters(&source, &mut bytes).unwrap();
        read_parameters(&mut target, &mut Cursor::new(bytes)).unwrap();

        assert_eq!(
            target.weight.to_vec::<f32>().unwrap(),
            source.weight.to_vec::<f32>().unwrap()
        );
        assert_eq!(target.bias.to_vec::<f32>().unwrap(), source.bias.to_vec::<f32>().unwrap());
    }

    #[test]
    fn test_truncated_stream_is_io_error() {
        let source = Linear::new(2, 2).unwrap();
        let mut bytes = Vec::new();
        write_parameters(&source, &mut bytes).unwrap();
        bytes.truncate(bytes.len() - 1);

        let mut target = Linear::new(2, 2).unwrap();
        match read_parameters(&mut target, &mut Cursor::new(bytes)) {
            Err(TensorError::Io(err)) => assert_eq!(err.kind(), ErrorKind::UnexpectedEof),
            other => panic!("expected UnexpectedEof, got {:?}", other),
        }
    }
}
