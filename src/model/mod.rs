pub mod onnx;

pub use onnx::{SimpleOnnxInitializer, SimpleOnnxInput, SimpleOnnxModel, SimpleOnnxNode};
