// DCZ1: binary weight files
//
// Format (all integers little-endian):
//
//   magic:        [u8; 4] = b"DCZ1"
//   param_count:  u32
//
//   For each parameter:
//     name_len:   u32
//     name:       [u8; name_len]  (UTF-8, dotted layer path, e.g. "l0.W")
//     ndim:       u32
//     dims:       [u64; ndim]
//     data:       [f32; product(dims)]  (row-major)
//
// Usage:
//   // Save
//   serialize::save_layer("model.dcz", &model)?;
//   serialize::save_params("weights.dcz", &named_tensors)?;
//
//   // Load
//   serialize::load_layer("model.dcz", &model, ShapePolicy::Strict)?;
//   let tensors = serialize::load_params("weights.dcz")?;
//
// A short read anywhere in the file is reported as InvalidFileFormat; other
// I/O failures keep their io::Error. Loading into a layer validates every
// entry before any parameter is assigned.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use dcz_core::{Error, Result, Shape, Tensor};
use dcz_nn::Layer;

const MAGIC: &[u8; 4] = b"DCZ1";

/// What `load_layer` does when the file and the layer disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShapePolicy {
    /// Fail on any unknown name, missing parameter or shape mismatch.
    #[default]
    Strict,
    /// Log a warning and skip the offending entry.
    Warn,
}

// Low-level IO helpers

fn write_u32(w: &mut impl Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64(w: &mut impl Write, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn eof_to_format(e: io::Error, what: &str) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::InvalidFileFormat(format!("truncated file while reading {what}"))
    } else {
        Error::Io(e)
    }
}

fn read_u32(r: &mut impl Read, what: &str) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(|e| eof_to_format(e, what))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read, what: &str) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(|e| eof_to_format(e, what))?;
    Ok(u64::from_le_bytes(buf))
}

/// Read exactly `len` bytes without trusting `len` for the allocation.
fn read_bytes(r: &mut impl Read, len: u64, what: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.take(len).read_to_end(&mut buf)?;
    if (buf.len() as u64) < len {
        return Err(Error::InvalidFileFormat(format!(
            "truncated file while reading {what}: expected {len} bytes, got {}",
            buf.len()
        )));
    }
    Ok(buf)
}

// Write

/// Write named tensors in the DCZ1 format.
pub fn write_params<'a, W, I>(writer: &mut W, params: I) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = (&'a str, &'a Tensor)>,
    I::IntoIter: ExactSizeIterator,
{
    let params = params.into_iter();
    writer.write_all(MAGIC)?;
    write_u32(writer, params.len() as u32)?;

    for (name, tensor) in params {
        let name = name.as_bytes();
        write_u32(writer, name.len() as u32)?;
        writer.write_all(name)?;

        let dims = tensor.dims();
        write_u32(writer, dims.len() as u32)?;
        for &d in dims {
            write_u64(writer, d as u64)?;
        }
        // to_vec yields logical row-major order for any layout
        let data: Vec<u8> = tensor
            .to_vec()
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        writer.write_all(&data)?;
    }
    Ok(())
}

/// Save named tensors to a file.
pub fn save_params(path: impl AsRef<Path>, params: &[(String, Tensor)]) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    write_params(&mut writer, params.iter().map(|(n, t)| (n.as_str(), t)))?;
    writer.flush()?;
    log::debug!(
        "saved {} tensors to {}",
        params.len(),
        path.as_ref().display()
    );
    Ok(())
}

/// Save every parameter of `layer`, buffers included, under its dotted name.
pub fn save_layer(path: impl AsRef<Path>, layer: &dyn Layer) -> Result<()> {
    let params: Vec<(String, Tensor)> = layer
        .params()
        .into_iter()
        .map(|(n, p)| (n, p.data()))
        .collect();
    save_params(path, &params)
}

// Read

/// Read named tensors in the DCZ1 format.
pub fn read_params(reader: &mut impl Read) -> Result<Vec<(String, Tensor)>> {
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|e| eof_to_format(e, "magic"))?;
    if &magic != MAGIC {
        return Err(Error::InvalidFileFormat(format!(
            "bad magic: expected {:?}, got {:?}",
            MAGIC, magic
        )));
    }

    let count = read_u32(reader, "parameter count")? as usize;
    let mut params = Vec::with_capacity(count.min(1024));
    for i in 0..count {
        let name_len = read_u32(reader, "name length")?;
        let name = String::from_utf8(read_bytes(reader, name_len as u64, "name")?)
            .map_err(|e| Error::InvalidFileFormat(format!("parameter {i}: name is not UTF-8: {e}")))?;

        let ndim = read_u32(reader, "rank")? as usize;
        let mut dims = Vec::with_capacity(ndim.min(16));
        for _ in 0..ndim {
            let d = read_u64(reader, "dims")?;
            dims.push(usize::try_from(d).map_err(|_| {
                Error::InvalidFileFormat(format!("{name}: dimension {d} too large"))
            })?);
        }
        let bytes = dims
            .iter()
            .try_fold(4u64, |acc, &d| acc.checked_mul(d as u64))
            .filter(|&b| usize::try_from(b).is_ok())
            .ok_or_else(|| {
                Error::InvalidFileFormat(format!("{name}: shape {dims:?} too large"))
            })?;
        let shape = Shape::new(dims);
        let data = read_bytes(reader, bytes, &name)?
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        params.push((name, Tensor::from_vec(data, shape)?));
    }
    Ok(params)
}

/// Load named tensors from a file.
pub fn load_params(path: impl AsRef<Path>) -> Result<Vec<(String, Tensor)>> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);
    read_params(&mut reader)
}

/// Load a file into the parameters of `layer`, matching by dotted name.
///
/// With [`ShapePolicy::Strict`] an unknown name fails with `MissingEntity`,
/// a layer parameter absent from the file fails with `MissingEntity` and a
/// disagreeing shape fails with `ShapeMismatch`; nothing is assigned unless
/// every entry checks out. With [`ShapePolicy::Warn`] each of those is logged
/// and skipped, and the remaining entries are assigned.
///
/// Lazily sized layers (Linear / Conv2d without an input size) must have run
/// a forward pass first so that their weights exist.
pub fn load_layer(path: impl AsRef<Path>, layer: &dyn Layer, policy: ShapePolicy) -> Result<()> {
    let path = path.as_ref();
    let entries = load_params(path)?;
    let params = layer.params();

    let mut assign = Vec::with_capacity(entries.len());
    for (name, tensor) in entries {
        let Some((_, param)) = params.iter().find(|(n, _)| *n == name) else {
            match policy {
                ShapePolicy::Strict => {
                    return Err(Error::MissingEntity(format!(
                        "{}: layer has no parameter '{name}'",
                        path.display()
                    )))
                }
                ShapePolicy::Warn => {
                    log::warn!("{}: skipping unknown parameter '{name}'", path.display());
                    continue;
                }
            }
        };
        if tensor.shape() != &param.shape() {
            match policy {
                ShapePolicy::Strict => {
                    return Err(Error::ShapeMismatch {
                        expected: param.shape(),
                        got: tensor.shape().clone(),
                    })
                }
                ShapePolicy::Warn => {
                    log::warn!(
                        "{}: '{name}' has shape {} in the file, {} in the layer; skipped",
                        path.display(),
                        tensor.shape(),
                        param.shape()
                    );
                    continue;
                }
            }
        }
        assign.push((name, param.clone(), tensor));
    }

    for (name, _) in &params {
        if assign.iter().any(|(n, _, _)| n == name) {
            continue;
        }
        match policy {
            ShapePolicy::Strict => {
                return Err(Error::MissingEntity(format!(
                    "{}: no entry for parameter '{name}'",
                    path.display()
                )))
            }
            ShapePolicy::Warn => {
                log::warn!("{}: '{name}' not loaded; keeping its current value", path.display())
            }
        }
    }

    log::debug!("loading {} parameters from {}", assign.len(), path.display());
    for (_, param, tensor) in assign {
        param.set_data(tensor);
    }
    Ok(())
}
