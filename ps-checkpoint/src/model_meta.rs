//! `model.json`/`model.binary`: the model-wide metadata a snapshot carries
//! alongside its tables, reusing the wire [`ModelMetaData`] shape so a
//! loaded snapshot and a freshly-joined node see the same structure.

pub use ps_wire::ModelMetaData;
