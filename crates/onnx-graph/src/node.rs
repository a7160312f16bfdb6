use std::collections::HashMap;
use crate::tensor::{tensor_key, DType, Shape, Tensor};
use crate::onnx;

pub trait Node {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor>;

    fn get_name(&self) -> Option<&str> {
        None
    }

    fn get_onnx_type(&self) -> &str;
    fn get_onnx_domain(&self) -> &str {
        ""
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![]
    }

    fn to_node_proto(&self, name: Option<String>, tensor_names: &HashMap<*const (), String>) -> onnx::NodeProto {
        let lookup = |tensor: &&dyn Tensor| tensor_names.get(&tensor_key(*tensor)).cloned().unwrap_or_default();
        onnx::NodeProto {
            name: name.unwrap_or_default(),
            input: self.get_input_tensors().iter().map(lookup).collect(),
            output: self.get_output_tensors().iter().map(lookup).collect(),
            op_type: self.get_onnx_type().to_string(),
            domain: self.get_onnx_domain().to_string(),
            attribute: self.get_onnx_attributes(),
            .. Default::default()
        }
    }
}

/// Identity key for a node, mirroring [`tensor_key`].
pub(crate) fn node_key(node: &dyn Node) -> *const () {
    std::ptr::from_ref(node).cast::<()>()
}

pub(crate) trait SingleOutputNode: Node {
    fn get_output_shape(&self) -> &Shape;

    fn get_output_dtype(&self) -> DType;
}

impl <T: SingleOutputNode> Tensor for T {
    fn dtype(&self) -> DType {
        self.get_output_dtype()
    }

    fn shape(&self) -> &Shape {
        self.get_output_shape()
    }

    fn get_node(&self) -> Option<&dyn Node> {
        Some(self)
    }

    fn get_name(&self) -> Option<&str> {
        <Self as Node>::get_name(self)
    }
}

pub(crate) fn int_attribute(name: &str, value: i64) -> onnx::AttributeProto {
    onnx::AttributeProto {
        name: name.to_string(),
        r#type: onnx::attribute_proto::AttributeType::Int as i32,
        i: value,
        .. Default::default()
    }
}

pub(crate) fn ints_attribute(name: &str, values: Vec<i64>) -> onnx::AttributeProto {
    onnx::AttributeProto {
        name: name.to_string(),
        r#type: onnx::attribute_proto::AttributeType::Ints as i32,
        ints: values,
        .. Default::default()
    }
}
