//! Inference devices and the classification session.
//!
//! A session owns one opened device and one graph allocated from the model
//! blob. Tensors go in one at a time; the index of the highest output score
//! comes back. Releasing the graph and closing the device happens on drop, so
//! every exit path from the capture loop tears the session down.

use anyhow::{Context, Result};
use std::fmt;
use std::path::Path;
use tract_onnx::prelude::*;

use crate::geometry::Tensor as InputTensor;

/// Kind of inference device compiled into the binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    /// Pure-Rust ONNX graph executor.
    Cpu,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub kind: DeviceKind,
    pub index: usize,
}

impl DeviceInfo {
    pub fn name(&self) -> String {
        match self.kind {
            DeviceKind::Cpu => format!("cpu:{}", self.index),
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Lists available devices, optionally restricted to one name (`cpu:0`).
pub fn enumerate_devices(selector: Option<&str>) -> Vec<DeviceInfo> {
    let available = [DeviceInfo {
        kind: DeviceKind::Cpu,
        index: 0,
    }];
    available
        .into_iter()
        .filter(|d| selector.is_none_or(|s| s.trim().eq_ignore_ascii_case(&d.name())))
        .collect()
}

/// Index of the highest score; the first one wins ties.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &score) in scores.iter().enumerate() {
        if best.is_none_or(|(_, top)| score > top) {
            best = Some((i, score));
        }
    }
    best.map(|(i, _)| i)
}

/// A graph allocated on a device: one tensor in, raw scores out.
pub trait Graph {
    fn run(&mut self, tensor: &InputTensor) -> Result<Vec<f32>>;
}

/// ONNX graph executed by `tract`.
pub struct TractGraph {
    plan: TypedRunnableModel<TypedModel>,
    size: u32,
}

impl TractGraph {
    /// Builds a runnable plan from an in-memory ONNX blob with a fixed
    /// `1 x 3 x size x size` input.
    pub fn from_blob(blob: &[u8], size: u32) -> Result<Self> {
        let mut reader = std::io::Cursor::new(blob);
        let plan = tract_onnx::onnx()
            .model_for_read(&mut reader)
            .context("failed to parse ONNX graph")?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size as usize, size as usize)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX graph")?
            .into_runnable()
            .context("failed to build runnable ONNX graph")?;
        Ok(Self { plan, size })
    }
}

impl Graph for TractGraph {
    fn run(&mut self, tensor: &InputTensor) -> Result<Vec<f32>> {
        if tensor.size != self.size {
            anyhow::bail!(
                "tensor is {0}x{0}, graph expects {1}x{1}",
                tensor.size,
                self.size
            );
        }
        let side = self.size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            tensor.data[(y * side + x) * 3 + c]
        })
        .into_tensor();

        let outputs = self
            .plan
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs.first().context("graph produced no outputs")?;
        let scores = output
            .to_array_view::<f32>()
            .context("graph output tensor was not f32")?;
        Ok(scores.iter().copied().collect())
    }
}

/// An opened device with an allocated graph.
pub struct Session {
    device: DeviceInfo,
    graph: Option<Box<dyn Graph>>,
    inferences: u64,
}

impl Session {
    /// Opens `device`, reads the model blob and allocates the graph.
    pub fn open(device: DeviceInfo, graph_path: &Path, size: u32) -> Result<Self> {
        tracing::info!("Opening device {device}");
        let blob = std::fs::read(graph_path)
            .with_context(|| format!("failed to read graph file: {}", graph_path.display()))?;
        let graph: Box<dyn Graph> = match device.kind {
            DeviceKind::Cpu => Box::new(
                TractGraph::from_blob(&blob, size)
                    .with_context(|| format!("failed to allocate graph from {}", graph_path.display()))?,
            ),
        };
        tracing::info!("Allocated graph ({} bytes) on {device}", blob.len());
        Ok(Self::with_graph(device, graph))
    }

    pub fn with_graph(device: DeviceInfo, graph: Box<dyn Graph>) -> Self {
        Self {
            device,
            graph: Some(graph),
            inferences: 0,
        }
    }

    pub fn inferences(&self) -> u64 {
        self.inferences
    }

    /// Runs one tensor and returns the winning class index. `tag` travels
    /// with the request and is reported alongside the result.
    pub fn predict_occupancy(&mut self, tensor: &InputTensor, tag: &str) -> Result<usize> {
        let graph = self.graph.as_mut().context("graph already deallocated")?;
        let scores = graph
            .run(tensor)
            .with_context(|| format!("inference failed for {tag}"))?;
        self.inferences += 1;
        let class = argmax(&scores).with_context(|| format!("empty result for {tag}"))?;
        tracing::debug!(tag, class, outputs = scores.len(), "inference result");
        Ok(class)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.graph.take().is_some() {
            tracing::info!(
                "Deallocated graph and closed {} after {} inferences",
                self.device,
                self.inferences
            );
        }
    }
}
