// Generates the `pb.Visit` service stubs. Messages are hand-written prost
// structs in `src/proto.rs`, so no protoc is needed at build time.
fn main() {
    let visit = tonic_build::manual::Service::builder()
        .name("Visit")
        .package("pb")
        .method(
            tonic_build::manual::Method::builder()
                .name("get")
                .route_name("Get")
                .input_type("crate::proto::Id")
                .output_type("crate::proto::VisitResponse")
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        )
        .method(
            tonic_build::manual::Method::builder()
                .name("set")
                .route_name("Set")
                .input_type("crate::proto::VisitRequest")
                .output_type("crate::proto::VisitResponse")
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        )
        .build();

    tonic_build::manual::Builder::new().compile(&[visit]);
}
