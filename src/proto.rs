//! Generated bindings for the small, locally-authored proto slices this
//! driver depends on: the runtime's image and snapshot services (both
//! consumed), and the CSI node-plugin surface (produced). See `build.rs`.

pub mod runtime_image {
    tonic::include_proto!("runtime.image.v1");
}

pub mod runtime_snapshot {
    tonic::include_proto!("runtime.snapshot.v1");
}

pub mod csi {
    tonic::include_proto!("csi.v1");
}
