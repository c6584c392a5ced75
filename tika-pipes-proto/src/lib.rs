//! Generated gRPC types and service stubs for the `Tika` service (§6.1).

pub mod tika {
    pub mod v1 {
        tonic::include_proto!("tika.v1");
    }
}
