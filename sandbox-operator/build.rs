use kube::CustomResourceExt;
use sandbox_types::Sandbox;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/sandbox.agent.io_sandboxes_crd.yaml",
        serde_yaml::to_string(&Sandbox::crd()).unwrap(),
    )
    .unwrap();

    // SAFETY: build scripts run single-threaded before any other code in this process touches the environment.
    unsafe { std::env::set_var("PROTOC", protobuf_src::protoc()) };

    tonic_prost_build::configure()
        .build_server(false)
        .compile_protos(&["proto/compute.proto"], &["proto"])
        .expect("failed to compile compute.proto");
}
