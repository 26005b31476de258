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

//! The global control service: the single authoritative metadata server of
//! the cluster. It reconstructs its world from the backing store at boot,
//! runs the node/job/actor/placement-group state machines on one main loop,
//! schedules actors and placement groups against the live resource view,
//! and fans metadata changes out over pub/sub.

pub mod actor_manager;
pub mod actor_scheduler;
pub mod config;
pub mod event;
pub mod grpc;
pub mod heartbeat_manager;
pub mod init_data;
pub mod internal_kv;
pub mod job_manager;
pub mod node_manager;
pub mod object_manager;
pub mod placement_group_manager;
pub mod placement_group_scheduler;
pub mod pubsub;
pub mod raylet_client;
pub mod resource_broadcaster;
pub mod resource_manager;
pub mod resource_report_poller;
pub mod resource_scheduler;
pub mod server;
pub mod storage;
pub mod store_failure_detector;
pub mod worker_manager;

pub use config::GcsServerConfig;
pub use server::GcsServer;
