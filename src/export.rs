use crate::{
    error::Error,
    tensor::{Element, Parameter, Parameters},
};
use indicatif::ProgressBar;
use ndarray::{ArrayBase, Data, Dimension};
use num_traits::ToBytes;
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::debug;

pub(crate) const DEFAULT_OUTPUT_DIR: &str = "./weights";

/// What a call to [`export`] wrote.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub(crate) struct Summary {
    pub(crate) files: usize,
    pub(crate) bytes: usize,
}

/// Path of the raw dump for the tensor called `name`.
pub(crate) fn tensor_path<P>(output_dir: P, name: &str) -> PathBuf
where
    P: AsRef<Path>,
{
    output_dir.as_ref().join(format!("{}.bin", name))
}

/// Write the elements of `array` in row-major order to `path`, with no header.
///
/// Arrays that are not in standard layout are copied into one first. Any
/// existing file at `path` is truncated. Returns the number of bytes written.
pub(crate) fn write_tensor<T, S, D, P>(array: &ArrayBase<S, D>, path: P) -> Result<usize, Error>
where
    T: Element,
    S: Data<Elem = T>,
    D: Dimension,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let standard = array.as_standard_layout();
    let values = standard
        .as_slice()
        .ok_or_else(|| Error::GetContiguousSlice(path.to_owned()))?;

    let file = File::create(path).map_err(|e| Error::CreateTensorFile(e, path.to_owned()))?;
    let mut writer = BufWriter::new(file);
    for value in values {
        writer
            .write_all(value.to_ne_bytes().as_ref())
            .map_err(|e| Error::WriteTensor(e, path.to_owned()))?;
    }
    // BufWriter swallows errors on drop
    writer
        .flush()
        .map_err(|e| Error::WriteTensor(e, path.to_owned()))?;

    Ok(values.len() * T::DTYPE.size())
}

fn write_parameter(parameter: &Parameter, path: &Path) -> Result<usize, Error> {
    match parameter {
        Parameter::F32(array) => write_tensor(array, path),
        Parameter::F64(array) => write_tensor(array, path),
        Parameter::I32(array) => write_tensor(array, path),
        Parameter::I64(array) => write_tensor(array, path),
    }
}

/// Dump every tensor in `tensors` to `<output_dir>/<name>.bin`.
#[inline]
pub(crate) fn export<P>(tensors: &Parameters, output_dir: P) -> Result<Summary, Error>
where
    P: AsRef<Path>,
{
    export_with_progress(tensors, output_dir, None)
}

/// Same as [`export`], ticking `progress` once per tensor written.
///
/// `output_dir` and its parents are created if missing. The first failure
/// aborts the export and files already written are left in place.
pub(crate) fn export_with_progress<P>(
    tensors: &Parameters,
    output_dir: P,
    progress: Option<&ProgressBar>,
) -> Result<Summary, Error>
where
    P: AsRef<Path>,
{
    let output_dir = output_dir.as_ref();
    fs::create_dir_all(output_dir).map_err(|e| Error::CreateOutputDir(e, output_dir.to_owned()))?;

    tensors
        .iter()
        .try_fold(Summary::default(), |summary, (name, parameter)| {
            if name.is_empty() {
                return Err(Error::EmptyTensorName);
            }

            let path = tensor_path(output_dir, name);
            let bytes = write_parameter(parameter, &path)?;
            debug_assert_eq!(bytes, parameter.byte_len());
            debug!(
                message = "wrote tensor",
                name = %name,
                dtype = ?parameter.dtype(),
                shape = ?parameter.shape(),
                bytes,
                path = %path.display(),
            );

            if let Some(progress) = progress {
                progress.set_message(name.clone());
                progress.inc(1);
            }

            Ok(Summary {
                files: summary.files + 1,
                bytes: summary.bytes + bytes,
            })
        })
}
