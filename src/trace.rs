use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{
    Array, ArrayBuilder, ArrayRef, AsArray, FixedSizeListArray, FixedSizeListBuilder, Float64Array,
    Float64Builder, RecordBatch, UInt64Array, UInt64Builder,
};
use arrow::datatypes::{DataType, Field, Float64Type, Schema, UInt64Type};

use crate::producer::AcceptedSample;

/// Collects accepted samples into Arrow columns.
pub struct TraceBuilder {
    dim: usize,
    steps: UInt64Builder,
    lanes: UInt64Builder,
    inputs: FixedSizeListBuilder<Float64Builder>,
    outputs: Float64Builder,
}

impl TraceBuilder {
    pub fn new(dim: usize) -> Self {
        Self::with_capacity(dim, 0)
    }

    pub fn with_capacity(dim: usize, capacity: usize) -> Self {
        let values = Float64Builder::with_capacity(capacity * dim);
        let inputs = FixedSizeListBuilder::with_capacity(values, dim as i32, capacity)
            .with_field(Field::new("item", DataType::Float64, false));
        Self {
            dim,
            steps: UInt64Builder::with_capacity(capacity),
            lanes: UInt64Builder::with_capacity(capacity),
            inputs,
            outputs: Float64Builder::with_capacity(capacity),
        }
    }

    pub fn append(&mut self, step: u64, lane: usize, sample: &AcceptedSample) {
        assert!(sample.inputs.len() == self.dim);
        self.steps.append_value(step);
        self.lanes.append_value(lane as u64);
        self.inputs.values().append_slice(&sample.inputs);
        self.inputs.append(true);
        self.outputs.append_value(sample.output);
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn finish(mut self) -> Result<StudyTrace> {
        let columns: Vec<(&str, ArrayRef)> = vec![
            ("step", Arc::new(self.steps.finish())),
            ("lane", Arc::new(self.lanes.finish())),
            ("inputs", Arc::new(self.inputs.finish())),
            ("output", Arc::new(self.outputs.finish())),
        ];
        let fields: Vec<Field> = columns
            .iter()
            .map(|(name, array)| Field::new(*name, array.data_type().clone(), false))
            .collect();
        let arrays = columns.into_iter().map(|(_, array)| array).collect();
        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
            .context("Could not convert trace to RecordBatch")?;
        Ok(StudyTrace { batch })
    }
}

/// Every accepted sample of a run as a record batch with the columns
/// `step`, `lane`, `inputs` and `output`.
#[derive(Debug, Clone)]
pub struct StudyTrace {
    batch: RecordBatch,
}

impl StudyTrace {
    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn steps(&self) -> &UInt64Array {
        self.batch.column(0).as_primitive::<UInt64Type>()
    }

    pub fn lanes(&self) -> &UInt64Array {
        self.batch.column(1).as_primitive::<UInt64Type>()
    }

    pub fn inputs(&self) -> &FixedSizeListArray {
        self.batch.column(2).as_fixed_size_list()
    }

    pub fn outputs(&self) -> &Float64Array {
        self.batch.column(3).as_primitive::<Float64Type>()
    }

    /// Input vector of row `row`.
    pub fn input_row(&self, row: usize) -> Vec<f64> {
        self.inputs()
            .value(row)
            .as_primitive::<Float64Type>()
            .values()
            .to_vec()
    }
}
