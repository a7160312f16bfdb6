use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use memmap2::Mmap;
use safetensors::SafeTensors;
use safetensors::tensor::{Metadata, TensorInfo};
use crate::{onnx, Error};
use crate::onnx::TensorProto;
use crate::tensor::{DType, Shape, Tensor, TensorData};

/// Decides where initializer bytes end up when a graph is serialized.
pub trait WeightOutputManager {
    fn write_tensor_data(&mut self, tensor_name: String, data: TensorData) -> Result<TensorProto, Error>;
    fn finalize_tensor_data(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Stores every initializer inline as `raw_data`.
#[derive(Default)]
pub struct EmbeddedOutputManager {}

impl EmbeddedOutputManager {
    pub fn new() -> Self {
        Self {}
    }
}

impl WeightOutputManager for EmbeddedOutputManager {
    fn write_tensor_data(&mut self, tensor_name: String, data: TensorData) -> Result<TensorProto, Error> {
        data.to_tensor_data_proto(Some(tensor_name))
    }
}

/// Appends initializer bytes to a side file and references them through
/// ONNX external-data entries.
pub struct BinOutputManager {
    output: BufWriter<File>,
    location: String,
    offset: usize,
}

impl BinOutputManager {
    pub fn new(output_location: &Path) -> Result<Self, Error> {
        let location = output_location.file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::InvalidInputError(format!("bad external data path {}", output_location.display())))?
            .to_string();
        let output = File::create(output_location)?;
        Ok(Self {
            output: BufWriter::new(output),
            location,
            offset: 0,
        })
    }
}

impl WeightOutputManager for BinOutputManager {
    fn write_tensor_data(&mut self, tensor_name: String, data: TensorData) -> Result<TensorProto, Error> {
        let byte_offset = self.offset;
        let raw = data.to_raw_encoding();
        self.output.write_all(&raw)?;
        self.offset += raw.len();

        let entry = |key: &str, value: String| onnx::StringStringEntryProto { key: key.to_string(), value };
        Ok(TensorProto {
            name: tensor_name,
            data_type: onnx::tensor_proto::DataType::from(data.dtype()) as i32,
            dims: data.shape().resolve()?.iter().map(|x| *x as i64).collect(),
            data_location: onnx::tensor_proto::DataLocation::External as i32,
            external_data: vec![
                entry("location", self.location.clone()),
                entry("offset", format!("{byte_offset}")),
                entry("length", format!("{}", raw.len())),
            ],
            .. Default::default()
        })
    }

    fn finalize_tensor_data(&mut self) -> Result<(), Error> {
        self.output.flush()?;
        Ok(())
    }
}

/// Named access to checkpoint tensors.
pub trait WeightManager {
    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error>;
    fn get_tensor_data(&self, name: &str) -> Result<TensorData, Error>;
    fn get_tensor_names(&self) -> Vec<String>;
}

pub struct SafetensorsWeightManagerInner {
    safetensors_files: Vec<Arc<Mmap>>,
    safetensors_metadata: Vec<(usize, Metadata)>
}

impl SafetensorsWeightManagerInner {
    pub fn new(safetensors_files: Vec<Arc<Mmap>>) -> Result<Self, Error> {
        let safetensors_metadata = {
            let mut out = vec![];
            for safetensors_mmap in &safetensors_files {
                out.push(SafeTensors::read_metadata(safetensors_mmap)?);
            }
            out
        };
        Ok(Self {
            safetensors_files,
            safetensors_metadata
        })
    }

    pub fn get_tensor_info(&self, name: &str) -> Option<(usize, TensorInfo)> {
        for (i, metadata) in self.safetensors_metadata.iter().enumerate() {
            if let Some(tensor_info) = metadata.1.info(name) {
                return Some((i, tensor_info.clone()));
            }
        }
        None
    }

    fn read_tensor(&self, file_index: usize, name: &str) -> Result<TensorData, Error> {
        let st = SafeTensors::deserialize(&self.safetensors_files[file_index])?;
        TensorData::from_safetensors_view(st.tensor(name)?)
    }

    fn get_tensor_names(&self) -> Vec<String> {
        let mut out = vec![];
        for metadata in &self.safetensors_metadata {
            out.extend(metadata.1.tensors().keys().cloned());
        }
        out.sort();
        out
    }
}

pub struct SafetensorsWeightManager {
    inner: Arc<SafetensorsWeightManagerInner>
}

impl SafetensorsWeightManager {
    pub fn new(safetensors_files: Vec<Arc<Mmap>>) -> Result<Self, Error> {
        Ok(Self {
            inner: Arc::new(SafetensorsWeightManagerInner::new(safetensors_files)?)
        })
    }

    /// Memory-maps each file and wraps them in a manager.
    pub fn open(paths: &[PathBuf]) -> Result<Self, Error> {
        let mut mmaps = vec![];
        for path in paths {
            let file = File::open(path)?;
            // The mapping is only read and the file is not modified while it lives.
            let mmap = unsafe { Mmap::map(&file) }?;
            mmaps.push(Arc::new(mmap));
        }
        Self::new(mmaps)
    }
}

impl WeightManager for SafetensorsWeightManager {
    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error> {
        Ok(Arc::new(SafetensorsTensor::new(self.inner.clone(), name.to_string())?))
    }
    fn get_tensor_data(&self, name: &str) -> Result<TensorData, Error> {
        let (file_index, _) = self.inner.get_tensor_info(name).ok_or_else(|| Error::NoSuchTensorError(name.to_string()))?;
        self.inner.read_tensor(file_index, name)
    }
    fn get_tensor_names(&self) -> Vec<String> {
        self.inner.get_tensor_names()
    }
}

/// A graph initializer backed by a tensor inside a mapped safetensors file.
pub struct SafetensorsTensor {
    name: String,
    inner: Arc<SafetensorsWeightManagerInner>,
    file_index: usize,
    data_type: DType,
    shape: Shape
}

impl SafetensorsTensor {
    pub fn new(inner: Arc<SafetensorsWeightManagerInner>, name: String) -> Result<Self, Error> {
        let (file_index, tensor_info) = inner.get_tensor_info(&name).ok_or(Error::NoSuchTensorError(name.to_string()))?;
        let data_type = DType::from_safetensors(tensor_info.dtype)?;
        let shape = Shape::from(tensor_info.shape.clone());
        Ok(Self {
            name,
            inner,
            file_index,
            data_type,
            shape
        })
    }
}

impl Tensor for SafetensorsTensor {
    fn dtype(&self) -> DType {
        self.data_type
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn get_initializer(&self, name: String, manager: &mut dyn WeightOutputManager) -> Result<Option<TensorProto>, Error> {
        let data = self.inner.read_tensor(self.file_index, &self.name)?;
        Ok(Some(manager.write_tensor_data(name, data)?))
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}
