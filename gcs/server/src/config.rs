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

/// GCS server configuration. One field per recognized option; everything has
/// a usable default so tests can use `GcsServerConfig::default()` and only
/// override what they exercise.
#[derive(Clone, Debug)]
pub struct GcsServerConfig {
    /// Address advertised to drivers via the reserved address key.
    pub node_ip_address: String,
    /// Transport knobs, consumed by the gRPC binding that hosts the
    /// services.
    pub grpc_server_port: u16,
    pub grpc_server_thread_num: usize,
    pub grpc_keepalive_time_ms: u64,

    /// Backing-store endpoint. Ignored by the in-memory store.
    pub redis_address: String,
    pub redis_port: u16,
    pub redis_password: String,
    pub enable_sharding_conn: bool,

    /// Select the direct in-process pub/sub over the store-backed one.
    pub grpc_pubsub_enabled: bool,
    /// Enable the push-based resource broadcaster; otherwise the poller
    /// alone is authoritative.
    pub grpc_based_resource_broadcast: bool,
    pub subscriber_timeout_ms: u64,
    pub publish_batch_size: usize,

    pub metrics_report_interval_ms: u64,
    /// 0 disables the periodic event-loop stats print.
    pub event_stats_print_interval_ms: u64,
    pub gcs_dump_debug_log_interval_minutes: u64,
    pub internal_gcs_service_connect_wait_milliseconds: u64,

    pub heartbeat_interval_ms: u64,
    pub num_heartbeats_timeout: u64,

    pub raylet_report_resources_period_ms: u64,
    pub raylet_poll_timeout_ms: u64,
    pub resource_broadcast_period_ms: u64,

    /// Deadline for the actor-creation RPC issued to a raylet.
    pub actor_creation_timeout_ms: u64,

    /// Grace before DEAD actor metadata is swept.
    pub actor_gc_delay_ms: u64,

    pub kv_retry_base_delay_ms: u64,
    pub kv_retry_max_attempts: u32,

    /// Open question from the data model: whether detached placement groups
    /// are removed when their creating job finishes.
    pub remove_detached_placement_groups_on_job_finish: bool,

    /// Capacity of the main event loop's channel.
    pub event_loop_buffer_size: usize,
}

impl Default for GcsServerConfig {
    fn default() -> Self {
        Self {
            node_ip_address: "127.0.0.1".to_owned(),
            grpc_server_port: 0,
            grpc_server_thread_num: 1,
            grpc_keepalive_time_ms: 10_000,
            redis_address: String::new(),
            redis_port: 6379,
            redis_password: String::new(),
            enable_sharding_conn: false,
            grpc_pubsub_enabled: false,
            grpc_based_resource_broadcast: false,
            subscriber_timeout_ms: 300_000,
            publish_batch_size: 5000,
            metrics_report_interval_ms: 10_000,
            event_stats_print_interval_ms: 0,
            gcs_dump_debug_log_interval_minutes: 1,
            internal_gcs_service_connect_wait_milliseconds: 1_000,
            heartbeat_interval_ms: 100,
            num_heartbeats_timeout: 30,
            raylet_report_resources_period_ms: 100,
            raylet_poll_timeout_ms: 1_000,
            resource_broadcast_period_ms: 100,
            actor_creation_timeout_ms: 10_000,
            actor_gc_delay_ms: 60_000,
            kv_retry_base_delay_ms: 100,
            kv_retry_max_attempts: 5,
            remove_detached_placement_groups_on_job_finish: true,
            event_loop_buffer_size: 10_000,
        }
    }
}

impl GcsServerConfig {
    /// Deadline budget granted to each node between heartbeats.
    pub fn heartbeat_timeout_ms(&self) -> u64 {
        self.heartbeat_interval_ms * self.num_heartbeats_timeout
    }
}
