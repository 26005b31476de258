// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Fixed-width opaque binary identifiers for every entity kind the control
//! service tracks. Ids are content-free; equality and hashing are the only
//! operations callers may rely on.

use std::fmt::{Debug, Display, Formatter};

use crate::error::{GcsError, Result};

pub const UNIQUE_ID_SIZE: usize = 28;
pub const JOB_ID_SIZE: usize = 4;
pub const ACTOR_ID_SIZE: usize = 16;
pub const TASK_ID_SIZE: usize = 24;
pub const OBJECT_ID_SIZE: usize = 28;
pub const PLACEMENT_GROUP_ID_SIZE: usize = 18;

/// Common surface of all fixed-width ids.
pub trait BaseId: Sized + Copy + Eq + Ord + std::hash::Hash {
    const SIZE: usize;

    fn from_binary(data: &[u8]) -> Result<Self>;

    fn from_hex(hex: &str) -> Result<Self>;

    fn from_random() -> Self;

    fn nil() -> Self;

    fn is_nil(&self) -> bool;

    fn as_bytes(&self) -> &[u8];

    fn binary(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn hex(&self) -> String {
        self.as_bytes().iter().map(|b| format!("{b:02x}")).collect()
    }
}

fn decode_hex(hex: &str, out: &mut [u8]) -> Result<()> {
    if !hex.is_ascii() {
        return Err(GcsError::Invalid("invalid hex id".to_owned()));
    }
    if hex.len() != out.len() * 2 {
        return Err(GcsError::Invalid(format!(
            "expected {} hex chars, got {}",
            out.len() * 2,
            hex.len()
        )));
    }
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
            .map_err(|e| GcsError::Invalid(format!("invalid hex id: {e}")))?;
    }
    Ok(())
}

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident, $size:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name {
            id: [u8; $size],
        }

        impl BaseId for $name {
            const SIZE: usize = $size;

            fn from_binary(data: &[u8]) -> Result<Self> {
                if data.len() != $size {
                    return Err(GcsError::Invalid(format!(
                        "{} expects {} bytes, got {}",
                        stringify!($name),
                        $size,
                        data.len()
                    )));
                }
                let mut id = [0u8; $size];
                id.copy_from_slice(data);
                Ok(Self { id })
            }

            fn from_hex(hex: &str) -> Result<Self> {
                let mut id = [0u8; $size];
                decode_hex(hex, &mut id)?;
                Ok(Self { id })
            }

            fn from_random() -> Self {
                let mut id = [0u8; $size];
                rand::Rng::fill(&mut rand::thread_rng(), &mut id[..]);
                Self { id }
            }

            fn nil() -> Self {
                Self { id: [0xff; $size] }
            }

            fn is_nil(&self) -> bool {
                self.id.iter().all(|b| *b == 0xff)
            }

            fn as_bytes(&self) -> &[u8] {
                &self.id
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
                write!(f, "{}", self.hex())
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.hex())
            }
        }
    };
}

define_id!(
    /// A raylet, one per node in the cluster.
    NodeId,
    UNIQUE_ID_SIZE
);
define_id!(
    /// A driver-submitted job.
    JobId,
    JOB_ID_SIZE
);
define_id!(ActorId, ACTOR_ID_SIZE);
define_id!(TaskId, TASK_ID_SIZE);
define_id!(ObjectId, OBJECT_ID_SIZE);
define_id!(WorkerId, UNIQUE_ID_SIZE);
define_id!(PlacementGroupId, PLACEMENT_GROUP_ID_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_round_trip() {
        let id = NodeId::from_random();
        let restored = NodeId::from_binary(id.as_bytes()).unwrap();
        assert_eq!(id, restored);
    }

    #[test]
    fn hex_round_trip() {
        let id = ActorId::from_random();
        let restored = ActorId::from_hex(&id.hex()).unwrap();
        assert_eq!(id, restored);
        assert_eq!(id.hex().len(), ACTOR_ID_SIZE * 2);
    }

    #[test]
    fn wrong_width_is_invalid() {
        let err = JobId::from_binary(&[1, 2, 3]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Invalid);
    }

    #[test]
    fn nil_is_nil() {
        assert!(PlacementGroupId::nil().is_nil());
        assert!(!PlacementGroupId::from_random().is_nil());
    }
}
