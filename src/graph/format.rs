// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! `MTGB` model file codec.
//!
//! Wire format:
//! ```text
//! [0..4)   magic "MTGB"
//! [4]      version 0x01
//!          string table   uleb(n) { uleb(len) utf8 }
//!          tensor table   uleb(n) { uleb(name) u8(dtype) u8(role) uleb(rank) { sleb(dim) }
//!                                   u8(has_data) [uleb(count) { le-bytes }] }
//!          node table     uleb(n) { uleb(name) u8(op) params u8(phase)
//!                                   uleb(n_in) { uleb(tensor) } uleb(n_out) { uleb(tensor) } }
//!          graph inputs   uleb(n) { uleb(tensor) }
//!          graph outputs  uleb(n) { uleb(tensor) }
//!          loss           u8(present) [uleb(tensor)]
//!          train params   f32 lr, f32 momentum, f32 weight_decay
//! [-32..]  SHA-256 over every preceding byte
//! ```
//!
//! A dim of `-1` marks a dynamic extent. Encoding is deterministic: the same
//! graph always yields the same bytes.

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

use super::varint::{read_len, read_sleb, write_sleb, write_uleb};
use super::{GraphError, GraphParts, GraphStore, ModelOrigin, Node, Phase, TensorDecl, TrainParams};
use crate::ops::OpKind;
use crate::tensor::{TensorData, TensorId, TensorRole};
use crate::types::{self, DType, ShapeDim};

pub const MAGIC: [u8; 4] = *b"MTGB";
pub const VERSION: u8 = 1;
const DIGEST_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("not a model file (magic {0:?})")]
    BadMagic([u8; 4]),
    #[error("unsupported model format version {0}")]
    UnsupportedVersion(u8),
    #[error("model file is truncated")]
    Truncated,
    #[error("checksum mismatch")]
    DigestMismatch,
    #[error("malformed model: {0}")]
    Malformed(String),
    #[error("invalid graph: {0}")]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn malformed(msg: impl Into<String>) -> FormatError {
    FormatError::Malformed(msg.into())
}

/// Encode a graph with its stored weight values and train params.
pub fn encode(graph: &GraphStore) -> Vec<u8> {
    encode_parts(&graph.parts())
}

pub(crate) fn encode_parts(parts: &GraphParts) -> Vec<u8> {
    let mut out = Vec::new();
    // Writes into a Vec cannot fail.
    let _ = Encoder::new(parts).encode(&mut out);
    let digest = Sha256::digest(&out);
    out.extend_from_slice(&digest);
    out
}

/// Decode and verify a model held in memory.
pub fn decode(bytes: &[u8]) -> Result<GraphStore, FormatError> {
    decode_with_path(bytes, None)
}

/// Read, decode and verify a model file.
pub fn load(path: &Path) -> Result<GraphStore, FormatError> {
    let bytes = std::fs::read(path)?;
    decode_with_path(&bytes, Some(path))
}

fn decode_with_path(bytes: &[u8], path: Option<&Path>) -> Result<GraphStore, FormatError> {
    if bytes.len() < MAGIC.len() + 1 + DIGEST_LEN {
        if bytes.len() >= 4 && bytes[..4] != MAGIC {
            return Err(FormatError::BadMagic([bytes[0], bytes[1], bytes[2], bytes[3]]));
        }
        return Err(FormatError::Truncated);
    }
    let (body, trailer) = bytes.split_at(bytes.len() - DIGEST_LEN);
    if body[..4] != MAGIC {
        return Err(FormatError::BadMagic([body[0], body[1], body[2], body[3]]));
    }
    if body[4] != VERSION {
        return Err(FormatError::UnsupportedVersion(body[4]));
    }
    let digest = Sha256::digest(body);
    if digest.as_slice() != trailer {
        return Err(FormatError::DigestMismatch);
    }
    let mut cursor = Cursor::new(&body[5..]);
    let parts = Decoder::default().decode(&mut cursor)?;
    if (cursor.position() as usize) != body.len() - 5 {
        return Err(malformed("trailing bytes after train params"));
    }
    let origin = ModelOrigin {
        path: path.map(Path::to_path_buf),
        digest: hex(&digest),
    };
    Ok(GraphStore::from_parts(parts)?.with_origin(origin))
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

struct Encoder<'a> {
    parts: &'a GraphParts,
    strings: Vec<&'a str>,
    string_ids: HashMap<&'a str, usize>,
}

impl<'a> Encoder<'a> {
    fn new(parts: &'a GraphParts) -> Self {
        let mut enc = Self {
            parts,
            strings: Vec::new(),
            string_ids: HashMap::new(),
        };
        for t in &parts.tensors {
            enc.intern(&t.name);
        }
        for n in &parts.nodes {
            enc.intern(&n.name);
        }
        enc
    }

    fn intern(&mut self, s: &'a str) -> usize {
        if let Some(&id) = self.string_ids.get(s) {
            return id;
        }
        let id = self.strings.len();
        self.strings.push(s);
        self.string_ids.insert(s, id);
        id
    }

    fn string(&self, s: &str) -> u64 {
        self.string_ids.get(s).copied().unwrap_or_default() as u64
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&MAGIC)?;
        w.write_all(&[VERSION])?;

        write_uleb(w, self.strings.len() as u64)?;
        for s in &self.strings {
            write_uleb(w, s.len() as u64)?;
            w.write_all(s.as_bytes())?;
        }

        write_uleb(w, self.parts.tensors.len() as u64)?;
        for t in &self.parts.tensors {
            write_uleb(w, self.string(&t.name))?;
            w.write_all(&[t.dtype.to_byte(), t.role.to_byte()])?;
            write_uleb(w, t.dims.len() as u64)?;
            for d in &t.dims {
                write_sleb(w, d.known().map_or(-1, |n| n as i64))?;
            }
            match &t.init {
                Some(data) => {
                    w.write_all(&[1])?;
                    write_uleb(w, data.len() as u64)?;
                    w.write_all(&data.to_le_bytes())?;
                }
                None => w.write_all(&[0])?,
            }
        }

        write_uleb(w, self.parts.nodes.len() as u64)?;
        for n in &self.parts.nodes {
            write_uleb(w, self.string(&n.name))?;
            w.write_all(&[n.op.code()])?;
            match n.op {
                OpKind::Linear { bias } => w.write_all(&[u8::from(bias)])?,
                OpKind::Dropout { ratio } => w.write_all(&ratio.to_le_bytes())?,
                _ => {}
            }
            w.write_all(&[n.phase.to_byte()])?;
            write_ids(w, &n.inputs)?;
            write_ids(w, &n.outputs)?;
        }

        write_ids(w, &self.parts.inputs)?;
        write_ids(w, &self.parts.outputs)?;
        match self.parts.loss {
            Some(id) => {
                w.write_all(&[1])?;
                write_uleb(w, id.index() as u64)?;
            }
            None => w.write_all(&[0])?,
        }
        let p = self.parts.params;
        for v in [p.learning_rate, p.momentum, p.weight_decay] {
            w.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }
}

fn write_ids<W: Write>(w: &mut W, ids: &[TensorId]) -> io::Result<()> {
    write_uleb(w, ids.len() as u64)?;
    for id in ids {
        write_uleb(w, id.index() as u64)?;
    }
    Ok(())
}

#[derive(Default)]
struct Decoder {
    strings: Vec<String>,
    tensor_count: usize,
}

type Input<'a> = Cursor<&'a [u8]>;

impl Decoder {
    fn decode(&mut self, r: &mut Input<'_>) -> Result<GraphParts, FormatError> {
        let n = count(r, 1)?;
        self.strings = Vec::with_capacity(n);
        for _ in 0..n {
            let len = count(r, 1)?;
            let mut buf = vec![0u8; len];
            read(r, &mut buf)?;
            let s = String::from_utf8(buf).map_err(|_| malformed("invalid UTF-8 in string table"))?;
            self.strings.push(s);
        }

        let n = count(r, 4)?;
        self.tensor_count = n;
        let mut tensors = Vec::with_capacity(n);
        for _ in 0..n {
            tensors.push(self.tensor(r)?);
        }

        let n = count(r, 4)?;
        let mut nodes = Vec::with_capacity(n);
        for _ in 0..n {
            nodes.push(self.node(r)?);
        }

        let inputs = self.ids(r)?;
        let outputs = self.ids(r)?;
        let loss = match byte(r)? {
            0 => None,
            1 => Some(self.id(r)?),
            b => return Err(malformed(format!("bad loss flag {b}"))),
        };
        let params = TrainParams {
            learning_rate: f32_le(r)?,
            momentum: f32_le(r)?,
            weight_decay: f32_le(r)?,
        };
        Ok(GraphParts {
            tensors,
            nodes,
            inputs,
            outputs,
            loss,
            params,
        })
    }

    fn string(&self, r: &mut Input<'_>) -> Result<String, FormatError> {
        let idx = read_len(r).map_err(eof)?;
        self.strings
            .get(idx)
            .cloned()
            .ok_or_else(|| malformed(format!("string index {idx} out of bounds")))
    }

    fn id(&self, r: &mut Input<'_>) -> Result<TensorId, FormatError> {
        let idx = read_len(r).map_err(eof)?;
        if idx >= self.tensor_count {
            return Err(malformed(format!("tensor index {idx} out of bounds")));
        }
        Ok(TensorId(idx))
    }

    fn ids(&self, r: &mut Input<'_>) -> Result<Vec<TensorId>, FormatError> {
        let n = count(r, 1)?;
        (0..n).map(|_| self.id(r)).collect()
    }

    fn tensor(&self, r: &mut Input<'_>) -> Result<TensorDecl, FormatError> {
        let name = self.string(r)?;
        let dtype = byte(r).and_then(|b| DType::from_byte(b).ok_or_else(|| malformed(format!("unknown dtype {b}"))))?;
        let role = byte(r)
            .and_then(|b| TensorRole::from_byte(b).ok_or_else(|| malformed(format!("unknown tensor role {b}"))))?;
        let rank = count(r, 1)?;
        let mut dims = Vec::with_capacity(rank);
        for _ in 0..rank {
            let dim = match read_sleb(r).map_err(eof)? {
                -1 => ShapeDim::Dynamic,
                d if d >= 0 => ShapeDim::Known(
                    usize::try_from(d).map_err(|_| malformed(format!("dim {d} of `{name}` too large")))?,
                ),
                d => return Err(malformed(format!("negative dim {d} in `{name}`"))),
            };
            dims.push(dim);
        }
        let init = match byte(r)? {
            0 => None,
            1 => {
                let len = count(r, dtype.size_bytes())?;
                let mut raw = vec![0u8; len * dtype.size_bytes()];
                read(r, &mut raw)?;
                TensorData::from_le_bytes(dtype, &raw)
            }
            b => return Err(malformed(format!("bad data flag {b} on `{name}`"))),
        };
        if let (Some(shape), Some(data)) = (ShapeDim::concrete(&dims), &init) {
            if types::element_count(&shape) != Some(data.len()) {
                return Err(malformed(format!("data length of `{name}` disagrees with its shape")));
            }
        }
        Ok(TensorDecl {
            name,
            dtype,
            dims,
            role,
            init,
        })
    }

    fn node(&self, r: &mut Input<'_>) -> Result<Node, FormatError> {
        let name = self.string(r)?;
        let code = byte(r)?;
        let op = match code {
            1 => OpKind::Linear {
                bias: match byte(r)? {
                    0 => false,
                    1 => true,
                    b => return Err(malformed(format!("bad bias flag {b} on `{name}`"))),
                },
            },
            2 => OpKind::MatMul,
            3 => OpKind::Add,
            4 => OpKind::Sub,
            5 => OpKind::Mul,
            6 => OpKind::Relu,
            7 => OpKind::Sigmoid,
            8 => OpKind::Tanh,
            9 => OpKind::Softmax,
            10 => OpKind::Dropout { ratio: f32_le(r)? },
            11 => OpKind::Identity,
            12 => OpKind::MseLoss,
            13 => OpKind::SoftmaxCrossEntropy,
            other => return Err(malformed(format!("unknown op code {other} on `{name}`"))),
        };
        let phase = byte(r).and_then(|b| Phase::from_byte(b).ok_or_else(|| malformed(format!("unknown phase {b}"))))?;
        let inputs = self.ids(r)?;
        let outputs = self.ids(r)?;
        Ok(Node {
            name,
            op,
            inputs,
            outputs,
            phase,
        })
    }
}

fn eof(e: io::Error) -> FormatError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FormatError::Truncated
    } else {
        malformed(e.to_string())
    }
}

fn remaining(r: &Input<'_>) -> usize {
    r.get_ref().len().saturating_sub(r.position() as usize)
}

/// Read an element count whose elements each occupy at least `min_bytes`,
/// rejecting counts the remaining input cannot hold.
fn count(r: &mut Input<'_>, min_bytes: usize) -> Result<usize, FormatError> {
    let n = read_len(r).map_err(eof)?;
    if n.saturating_mul(min_bytes) > remaining(r) {
        return Err(FormatError::Truncated);
    }
    Ok(n)
}

fn read(r: &mut Input<'_>, buf: &mut [u8]) -> Result<(), FormatError> {
    r.read_exact(buf).map_err(eof)
}

fn byte(r: &mut Input<'_>) -> Result<u8, FormatError> {
    let mut b = [0u8; 1];
    read(r, &mut b)?;
    Ok(b[0])
}

fn f32_le(r: &mut Input<'_>) -> Result<f32, FormatError> {
    let mut b = [0u8; 4];
    read(r, &mut b)?;
    Ok(f32::from_le_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;

    fn sample() -> GraphStore {
        let mut b = GraphBuilder::new();
        let x = b.input("x", DType::F32, vec![ShapeDim::Dynamic, ShapeDim::Known(3)]);
        let y = b.input("y", DType::I32, vec![ShapeDim::Dynamic]);
        let w = b.weight("w", vec![3, 2], vec![0.5, -1.0, 2.0, 0.25, 0.0, 1.5]);
        let bias = b.weight("b", vec![2], vec![0.1, 0.2]);
        let h = b.node("fc", OpKind::Linear { bias: true }, &[x, w, bias], Phase::Always);
        let d = b.node("drop", OpKind::Dropout { ratio: 0.25 }, &[h], Phase::TrainOnly);
        let p = b.node("probs", OpKind::Softmax, &[h], Phase::EvalOnly);
        let l = b.node("loss", OpKind::SoftmaxCrossEntropy, &[d, y], Phase::TrainOnly);
        b.output(p).output(l).loss(l);
        b.build().unwrap()
    }

    #[test]
    fn decode_reproduces_structure_and_weights() {
        let g = sample();
        let bytes = encode(&g);
        assert_eq!(&bytes[..4], b"MTGB");
        let back = decode(&bytes).unwrap();
        assert!(g.same_structure(&back));
        let w = back.tensor_id("w").unwrap();
        assert_eq!(back.tensor(w).unwrap().init, g.tensor(w).unwrap().init);
        assert_eq!(back.train_params(), g.train_params());
        assert_eq!(back.digest().map(str::len), Some(64));
    }

    #[test]
    fn encoding_is_deterministic() {
        assert_eq!(encode(&sample()), encode(&sample()));
    }

    #[test]
    fn corrupted_byte_fails_checksum() {
        let mut bytes = encode(&sample());
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x40;
        assert!(matches!(decode(&bytes), Err(FormatError::DigestMismatch)));
    }

    #[test]
    fn header_errors() {
        assert!(matches!(decode(b"MT"), Err(FormatError::Truncated)));
        let mut bytes = encode(&sample());
        bytes[0] = b'X';
        assert!(matches!(decode(&bytes), Err(FormatError::BadMagic(_))));
        let mut bytes = encode(&sample());
        bytes[4] = 9;
        assert!(matches!(decode(&bytes), Err(FormatError::UnsupportedVersion(9))));
    }

    #[test]
    fn truncated_body_with_valid_digest_is_rejected() {
        let bytes = encode(&sample());
        let body = &bytes[..bytes.len() - DIGEST_LEN - 6];
        let mut forged = body.to_vec();
        let digest = Sha256::digest(&forged);
        forged.extend_from_slice(&digest);
        assert!(matches!(decode(&forged), Err(FormatError::Truncated)));
    }

    #[test]
    fn structurally_invalid_graph_is_rejected() {
        let mut parts = sample().parts();
        // `fc` now consumes `probs`, which is produced after it.
        parts.nodes[0].inputs[0] = parts.outputs[0];
        let bytes = encode_parts(&parts);
        assert!(matches!(decode(&bytes), Err(FormatError::Graph(_))));
    }
}
