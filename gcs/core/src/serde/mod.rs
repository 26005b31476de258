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

use std::io::Cursor;

use prost::Message;

use crate::error::{GcsError, Result};

pub mod protobuf;

pub fn encode_protobuf<T: Message>(message: &T) -> Vec<u8> {
    message.encode_to_vec()
}

pub fn decode_protobuf<T: Message + Default>(bytes: &[u8]) -> Result<T> {
    let mut buf = Cursor::new(bytes);

    T::decode(&mut buf).map_err(|e| GcsError::Invalid(format!("{e:?}")))
}
