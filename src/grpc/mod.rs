//! gRPC prediction service
//!
//! Serves `serving.v1.PredictionService/Predict` over the generated protobuf
//! types, sharing the Executor with the HTTP adapter.

pub mod server;
pub mod service;

// Include generated proto code
pub mod proto {
    pub mod onnx {
        include!(concat!(env!("OUT_DIR"), "/onnx.rs"));
    }

    pub mod serving {
        pub mod v1 {
            include!(concat!(env!("OUT_DIR"), "/serving.v1.rs"));
        }
    }
}

pub use server::start_grpc_server;
pub use service::{CLIENT_REQUEST_ID_HEADER, PredictionServiceImpl, REQUEST_ID_HEADER};
