//! Value-set representations and their intersection kernels.
//!
//! Every backend variant keeps the same logical object, a set of partition
//! key values, in a different physical shape. The dense and roaring shapes
//! address values by their non-negative integer index.

use bitvec::prelude::{BitVec, Lsb0};
use data_types::{BackendKind, Datatype, Value};
use roaring::RoaringBitmap;
use snafu::Snafu;
use std::collections::BTreeSet;

/// Errors building or combining value sets.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum SetError {
    #[snafu(display("the {backend} representation cannot hold {datatype} values"))]
    UnsupportedDatatype {
        backend: BackendKind,
        datatype: Datatype,
    },

    #[snafu(display("value {value} has no non-negative integer index"))]
    NotIndexable { value: String },

    #[snafu(display("value {value} exceeds the 32 bit index space"))]
    IndexTooLarge { value: String },

    #[snafu(display("cannot intersect {left} with {right} sets"))]
    RepresentationMismatch {
        left: BackendKind,
        right: BackendKind,
    },
}

/// Convenience result alias for this module.
pub type Result<T, E = SetError> = std::result::Result<T, E>;

/// A set of partition key values in one of the backend representations.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueSet {
    /// Sorted, de-duplicated array; all datatypes.
    SortedArray {
        /// Datatype of all members.
        datatype: Datatype,
        /// Sorted distinct values.
        values: Vec<Value>,
    },
    /// Dense bit vector addressed by value index.
    Bits {
        /// Datatype of all members (an integer type).
        datatype: Datatype,
        /// Bit `i` set means value `i` is a member.
        bits: BitVec<u8, Lsb0>,
    },
    /// Compressed roaring bitmap of 32 bit indices.
    Roaring {
        /// The bitmap; members are `Int32` values.
        bitmap: RoaringBitmap,
    },
    /// Unordered set; all datatypes.
    Generic {
        /// Datatype of all members.
        datatype: Datatype,
        /// Distinct values, kept in a `BTreeSet` for deterministic
        /// enumeration.
        values: BTreeSet<Value>,
    },
}

impl ValueSet {
    /// Build a set of `kind` from `values`, validating representation
    /// constraints.
    pub fn from_values(kind: BackendKind, datatype: Datatype, values: &[Value]) -> Result<Self> {
        if !kind.supports(datatype) {
            return UnsupportedDatatypeSnafu {
                backend: kind,
                datatype,
            }
            .fail();
        }

        match kind {
            BackendKind::Array => {
                let mut sorted: Vec<Value> = values.to_vec();
                sorted.sort();
                sorted.dedup();
                Ok(Self::SortedArray {
                    datatype,
                    values: sorted,
                })
            }
            BackendKind::Bit => {
                let mut bits: BitVec<u8, Lsb0> = BitVec::new();
                for value in values {
                    let index = value.to_index().ok_or_else(|| {
                        NotIndexableSnafu {
                            value: value.to_string(),
                        }
                        .build()
                    })? as usize;
                    if index >= bits.len() {
                        bits.resize(index + 1, false);
                    }
                    bits.set(index, true);
                }
                Ok(Self::Bits { datatype, bits })
            }
            BackendKind::RoaringBit => {
                let mut bitmap = RoaringBitmap::new();
                for value in values {
                    let index = value.to_index().ok_or_else(|| {
                        NotIndexableSnafu {
                            value: value.to_string(),
                        }
                        .build()
                    })?;
                    let index = u32::try_from(index).map_err(|_| {
                        IndexTooLargeSnafu {
                            value: value.to_string(),
                        }
                        .build()
                    })?;
                    bitmap.insert(index);
                }
                Ok(Self::Roaring { bitmap })
            }
            BackendKind::Generic => Ok(Self::Generic {
                datatype,
                values: values.iter().cloned().collect(),
            }),
        }
    }

    /// The representation tag of this set.
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::SortedArray { .. } => BackendKind::Array,
            Self::Bits { .. } => BackendKind::Bit,
            Self::Roaring { .. } => BackendKind::RoaringBit,
            Self::Generic { .. } => BackendKind::Generic,
        }
    }

    /// Number of members.
    pub fn cardinality(&self) -> u64 {
        match self {
            Self::SortedArray { values, .. } => values.len() as u64,
            Self::Bits { bits, .. } => bits.count_ones() as u64,
            Self::Roaring { bitmap } => bitmap.len(),
            Self::Generic { values, .. } => values.len() as u64,
        }
    }

    /// Whether the set has no members.
    pub fn is_empty(&self) -> bool {
        self.cardinality() == 0
    }

    /// Enumerate the members as values, in a deterministic order.
    pub fn values(&self) -> Vec<Value> {
        match self {
            Self::SortedArray { values, .. } => values.clone(),
            Self::Bits { datatype, bits } => bits
                .iter_ones()
                .filter_map(|i| Value::from_index(*datatype, i as u64))
                .collect(),
            Self::Roaring { bitmap } => bitmap
                .iter()
                .filter_map(|i| Value::from_index(Datatype::Int32, u64::from(i)))
                .collect(),
            Self::Generic { values, .. } => values.iter().cloned().collect(),
        }
    }

    /// The largest value index present, for bit-bound bookkeeping.
    pub fn max_index(&self) -> Option<u64> {
        match self {
            Self::Bits { bits, .. } => bits.iter_ones().last().map(|i| i as u64),
            Self::Roaring { bitmap } => bitmap.max().map(u64::from),
            Self::SortedArray { values, .. } => values.iter().filter_map(Value::to_index).max(),
            Self::Generic { values, .. } => values.iter().filter_map(Value::to_index).max(),
        }
    }

    /// Intersect two sets of the same representation.
    pub fn intersect(&self, other: &Self) -> Result<Self> {
        match (self, other) {
            (
                Self::SortedArray {
                    datatype,
                    values: a,
                },
                Self::SortedArray { values: b, .. },
            ) => Ok(Self::SortedArray {
                datatype: *datatype,
                values: merge_intersect(a, b),
            }),
            (
                Self::Bits { datatype, bits: a },
                Self::Bits { bits: b, .. },
            ) => {
                let len = a.len().min(b.len());
                let mut bits: BitVec<u8, Lsb0> = BitVec::repeat(false, len);
                for i in a[..len].iter_ones() {
                    if b[i] {
                        bits.set(i, true);
                    }
                }
                Ok(Self::Bits {
                    datatype: *datatype,
                    bits,
                })
            }
            (Self::Roaring { bitmap: a }, Self::Roaring { bitmap: b }) => Ok(Self::Roaring {
                bitmap: a & b,
            }),
            (
                Self::Generic {
                    datatype,
                    values: a,
                },
                Self::Generic { values: b, .. },
            ) => Ok(Self::Generic {
                datatype: *datatype,
                values: a.intersection(b).cloned().collect(),
            }),
            (left, right) => RepresentationMismatchSnafu {
                left: left.kind(),
                right: right.kind(),
            }
            .fail(),
        }
    }
}

/// Linear merge of two sorted distinct vectors.
fn merge_intersect(a: &[Value], b: &[Value]) -> Vec<Value> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// Intersect a sequence of sets; `None` input members are ignored (their
/// value sets are unknown, which is a superset of anything), an empty
/// iterator yields `None` ("no constraint").
pub fn intersect_all<I>(sets: I) -> Result<Option<ValueSet>>
where
    I: IntoIterator<Item = ValueSet>,
{
    let mut result: Option<ValueSet> = None;
    for set in sets {
        result = Some(match result {
            None => set,
            Some(acc) => acc.intersect(&set)?,
        });
    }
    Ok(result)
}
