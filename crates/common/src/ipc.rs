//! Arrow IPC stream encode/decode helpers.
//!
//! Datasets move between the control process and nodes as IPC stream
//! payloads; schemas travel as an IPC stream with no batches.

use std::io::Cursor;

use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;

use crate::{Result, ShfError};

/// Serialize one batch as an Arrow IPC stream.
pub fn encode_batch(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut out, batch.schema().as_ref())
            .map_err(|e| ShfError::Protocol(format!("ipc writer init failed: {e}")))?;
        writer
            .write(batch)
            .map_err(|e| ShfError::Protocol(format!("ipc write failed: {e}")))?;
        writer
            .finish()
            .map_err(|e| ShfError::Protocol(format!("ipc finish failed: {e}")))?;
    }
    Ok(out)
}

/// Serialize a bare schema as an Arrow IPC stream with zero batches.
pub fn encode_schema(schema: &SchemaRef) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut out, schema.as_ref())
            .map_err(|e| ShfError::Protocol(format!("ipc writer init failed: {e}")))?;
        writer
            .finish()
            .map_err(|e| ShfError::Protocol(format!("ipc finish failed: {e}")))?;
    }
    Ok(out)
}

/// Deserialize an Arrow IPC stream into its schema and batches.
pub fn decode_stream(bytes: &[u8]) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| ShfError::Protocol(format!("ipc reader init failed: {e}")))?;
    let schema = reader.schema();
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(|e| ShfError::Protocol(format!("ipc decode failed: {e}")))?);
    }
    Ok((schema, batches))
}
