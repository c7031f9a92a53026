use crate::{
    error::Error,
    source::ParameterSource,
    tensor::{Dtype, Element, Parameter, Parameters},
};
use ndarray::{ArrayD, IxDyn};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    convert::TryFrom,
    fs,
    path::{Path, PathBuf},
};
use tracing::trace;

const HEADER_LENGTH_SIZE: usize = std::mem::size_of::<u64>();
const METADATA_KEY: &str = "__metadata__";

#[derive(Debug, Clone, Deserialize)]
struct TensorInfo {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

/// A safetensors checkpoint read fully into memory.
///
/// Layout is an 8 byte little-endian header length, a JSON header describing
/// every tensor, then the little-endian tensor data.
#[derive(Debug)]
pub(crate) struct Checkpoint {
    path: PathBuf,
    tensors: BTreeMap<String, TensorInfo>,
    data: Vec<u8>,
}

impl Checkpoint {
    pub(crate) fn open<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| Error::ReadCheckpoint(e, path.to_owned()))?;
        let mut checkpoint = Self::from_bytes(bytes)?;
        checkpoint.path = path.to_owned();
        Ok(checkpoint)
    }

    pub(crate) fn from_bytes(mut bytes: Vec<u8>) -> Result<Self, Error> {
        if bytes.len() < HEADER_LENGTH_SIZE {
            return Err(Error::TruncatedHeaderLength(bytes.len()));
        }

        let mut length = [0_u8; HEADER_LENGTH_SIZE];
        length.copy_from_slice(&bytes[..HEADER_LENGTH_SIZE]);
        let header_len = u64::from_le_bytes(length);
        let header_end = usize::try_from(header_len)
            .ok()
            .and_then(|len| len.checked_add(HEADER_LENGTH_SIZE))
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| Error::HeaderLengthOutOfBounds(header_len, bytes.len()))?;

        let mut header: BTreeMap<String, serde_json::Value> =
            serde_json::from_slice(&bytes[HEADER_LENGTH_SIZE..header_end])
                .map_err(Error::ParseHeader)?;
        if let Some(metadata) = header.remove(METADATA_KEY) {
            trace!(message = "ignoring checkpoint metadata", %metadata);
        }
        let tensors = header
            .into_iter()
            .map(|(name, info)| {
                serde_json::from_value(info)
                    .map(|info| (name, info))
                    .map_err(Error::ParseHeader)
            })
            .collect::<Result<BTreeMap<String, TensorInfo>, _>>()?;

        let data = bytes.split_off(header_end);
        trace!(
            message = "parsed checkpoint header",
            tensors = tensors.len(),
            header_len,
            data_len = data.len()
        );

        Ok(Self {
            path: PathBuf::new(),
            tensors,
            data,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn len(&self) -> usize {
        self.tensors.len()
    }

    fn tensor(&self, name: &str, info: &TensorInfo) -> Result<Parameter, Error> {
        let dtype = Dtype::parse(&info.dtype)
            .ok_or_else(|| Error::UnsupportedDtype(name.to_owned(), info.dtype.clone()))?;

        let [begin, end] = info.data_offsets;
        if begin > end || end > self.data.len() {
            return Err(Error::DataOffsetsOutOfBounds(
                name.to_owned(),
                begin,
                end,
                self.data.len(),
            ));
        }

        let bytes = &self.data[begin..end];
        let expected = info
            .shape
            .iter()
            .try_fold(dtype.size(), |size, &dim| size.checked_mul(dim))
            .ok_or_else(|| Error::ShapeOverflow(name.to_owned(), info.shape.clone()))?;
        if bytes.len() != expected {
            return Err(Error::DataLengthMismatch(
                name.to_owned(),
                bytes.len(),
                expected,
            ));
        }

        Ok(match dtype {
            Dtype::F32 => decode::<f32>(name, &info.shape, bytes)?.into(),
            Dtype::F64 => decode::<f64>(name, &info.shape, bytes)?.into(),
            Dtype::I32 => decode::<i32>(name, &info.shape, bytes)?.into(),
            Dtype::I64 => decode::<i64>(name, &info.shape, bytes)?.into(),
        })
    }
}

fn decode<T>(name: &str, shape: &[usize], bytes: &[u8]) -> Result<ArrayD<T>, Error>
where
    T: Element,
{
    let values = bytes
        .chunks_exact(T::DTYPE.size())
        .map(T::from_le_chunk)
        .collect();
    ArrayD::from_shape_vec(IxDyn(shape), values)
        .map_err(|e| Error::ConstructArray(e, name.to_owned()))
}

impl ParameterSource for Checkpoint {
    fn parameters(&self) -> Result<Parameters, Error> {
        self.tensors
            .iter()
            .map(|(name, info)| Ok((name.clone(), self.tensor(name, info)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Build a checkpoint from `(name, dtype, shape, little-endian data)` entries.
    fn checkpoint_bytes(entries: &[(&str, &str, Vec<usize>, Vec<u8>)]) -> Vec<u8> {
        let mut header = serde_json::Map::new();
        header.insert(METADATA_KEY.to_owned(), json!({ "format": "pt" }));
        let mut data = Vec::new();
        for (name, dtype, shape, bytes) in entries {
            let begin = data.len();
            data.extend_from_slice(bytes);
            header.insert(
                (*name).to_owned(),
                json!({ "dtype": dtype, "shape": shape, "data_offsets": [begin, data.len()] }),
            );
        }
        let header = serde_json::to_vec(&header).unwrap();

        let mut out = (header.len() as u64).to_le_bytes().to_vec();
        out.extend_from_slice(&header);
        out.extend_from_slice(&data);
        out
    }

    fn le_f32s(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes().to_vec()).collect()
    }

    #[test]
    fn reads_batchnorm_state() {
        let bytes = checkpoint_bytes(&[
            ("bn1.weight", "F32", vec![2], le_f32s(&[1.0, 0.5])),
            ("bn1.running_var", "F32", vec![2], le_f32s(&[0.25, 4.0])),
            (
                "bn1.num_batches_tracked",
                "I64",
                vec![],
                7_i64.to_le_bytes().to_vec(),
            ),
        ]);
        let checkpoint = Checkpoint::from_bytes(bytes).unwrap();
        assert_eq!(checkpoint.len(), 3);

        let parameters = checkpoint.parameters().unwrap();
        assert_eq!(
            parameters["bn1.weight"],
            Parameter::from(ndarray::arr1(&[1.0_f32, 0.5]).into_dyn())
        );
        assert_eq!(
            parameters["bn1.num_batches_tracked"],
            Parameter::from(ArrayD::from_elem(IxDyn(&[]), 7_i64))
        );
    }

    #[test]
    fn keeps_shape() {
        let values: Vec<f32> = (0..6).map(|i| i as f32).collect();
        let bytes = checkpoint_bytes(&[("fc.weight", "F32", vec![2, 3], le_f32s(&values))]);
        let parameters = Checkpoint::from_bytes(bytes).unwrap().parameters().unwrap();
        match &parameters["fc.weight"] {
            Parameter::F32(array) => {
                assert_eq!(array.shape(), &[2, 3]);
                assert_eq!(array[IxDyn(&[1, 0])], 3.0);
            }
            other => panic!("unexpected parameter {:?}", other),
        }
    }

    #[test]
    fn open_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        fs::write(
            &path,
            checkpoint_bytes(&[("w", "F64", vec![1], 2.5_f64.to_le_bytes().to_vec())]),
        )
        .unwrap();

        let checkpoint = Checkpoint::open(&path).unwrap();
        assert_eq!(checkpoint.path(), path.as_path());
        assert_eq!(checkpoint.parameters().unwrap().len(), 1);
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Checkpoint::open(dir.path().join("nope.safetensors")),
            Err(Error::ReadCheckpoint(_, _))
        ));
    }

    #[test]
    fn too_short_for_header_length() {
        assert!(matches!(
            Checkpoint::from_bytes(vec![1, 2, 3]),
            Err(Error::TruncatedHeaderLength(3))
        ));
    }

    #[test]
    fn header_length_past_end() {
        let mut bytes = 100_u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        assert!(matches!(
            Checkpoint::from_bytes(bytes),
            Err(Error::HeaderLengthOutOfBounds(100, 10))
        ));
    }

    #[test]
    fn invalid_json() {
        let mut bytes = 3_u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{x}");
        assert!(matches!(
            Checkpoint::from_bytes(bytes),
            Err(Error::ParseHeader(_))
        ));
    }

    #[test]
    fn unsupported_dtype() {
        let bytes = checkpoint_bytes(&[("w", "BF16", vec![1], vec![0, 0])]);
        let checkpoint = Checkpoint::from_bytes(bytes).unwrap();
        match checkpoint.parameters() {
            Err(Error::UnsupportedDtype(name, dtype)) => {
                assert_eq!(name, "w");
                assert_eq!(dtype, "BF16");
            }
            other => panic!("expected UnsupportedDtype, got {:?}", other),
        }
    }

    #[test]
    fn shape_and_data_disagree() {
        let bytes = checkpoint_bytes(&[("w", "F32", vec![3], le_f32s(&[1.0, 2.0]))]);
        assert!(matches!(
            Checkpoint::from_bytes(bytes).unwrap().parameters(),
            Err(Error::DataLengthMismatch(_, 8, 12))
        ));
    }

    #[test]
    fn offsets_out_of_bounds() {
        let header = serde_json::to_vec(
            &json!({ "w": { "dtype": "F32", "shape": [1], "data_offsets": [0, 4] } }),
        )
        .unwrap();
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(&header);

        assert!(matches!(
            Checkpoint::from_bytes(bytes).unwrap().parameters(),
            Err(Error::DataOffsetsOutOfBounds(_, 0, 4, 0))
        ));
    }

    #[test]
    fn shape_overflows_usize() {
        let bytes = checkpoint_bytes(&[("w", "F32", vec![usize::MAX, 2], vec![])]);
        match Checkpoint::from_bytes(bytes).unwrap().parameters() {
            Err(Error::ShapeOverflow(name, shape)) => {
                assert_eq!(name, "w");
                assert_eq!(shape, vec![usize::MAX, 2]);
            }
            other => panic!("expected ShapeOverflow, got {:?}", other),
        }
    }

    #[test]
    fn offsets_reversed() {
        let header = serde_json::to_vec(
            &json!({ "w": { "dtype": "F32", "shape": [1], "data_offsets": [4, 0] } }),
        )
        .unwrap();
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&le_f32s(&[1.0]));

        assert!(matches!(
            Checkpoint::from_bytes(bytes).unwrap().parameters(),
            Err(Error::DataOffsetsOutOfBounds(_, 4, 0, 4))
        ));
    }

    #[test]
    fn metadata_only_checkpoint_is_empty() {
        let checkpoint = Checkpoint::from_bytes(checkpoint_bytes(&[])).unwrap();
        assert_eq!(checkpoint.len(), 0);
        assert!(checkpoint.parameters().unwrap().is_empty());
    }
}
