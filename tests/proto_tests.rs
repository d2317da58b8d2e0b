//! Wire round-trip tests: every oneof arm encodes and decodes back to
//! an equal model value, and binding order is canonical.

use thunkrun::path::{CommandPath, DirPath, FileOrDirPath, FilePath, FsPath, HostPath};
use thunkrun::platform::Platform;
use thunkrun::proto;
use thunkrun::thunk::{CachePath, ImageRef, MountSource, Thunk, ThunkCmd, ThunkImage, ThunkPath};
use thunkrun::value::{Bindings, Secret, Value};

fn producer() -> Thunk {
    Thunk::new(ThunkCmd::Command(CommandPath::new("make").unwrap())).with_image(ThunkImage::Ref(
        ImageRef::from_repository(Platform::linux(), "golang").with_tag("1.22"),
    ))
}

fn every_value() -> Vec<Value> {
    let tp = ThunkPath::new(producer(), FileOrDirPath::file("out/bin").unwrap()).unwrap();

    let mut object = Bindings::new();
    object.insert("name".to_string(), Value::from("nested"));
    object.insert("count".to_string(), Value::Int(2));

    vec![
        Value::Null,
        Value::Bool(true),
        Value::Int(-42),
        Value::from("plain"),
        Value::Secret(Secret::new("tok", b"bytes".to_vec())),
        Value::File(FilePath::new("f.txt").unwrap()),
        Value::Dir(DirPath::new("sub/dir").unwrap()),
        Value::Command(CommandPath::new("cc").unwrap()),
        Value::Host(HostPath::new("/src/app", FileOrDirPath::dir(".").unwrap()).unwrap()),
        Value::Fs(FsPath::new("stdlib", FileOrDirPath::file("init").unwrap()).unwrap()),
        Value::ThunkPath(tp),
        Value::Thunk(Box::new(producer())),
        Value::Array(vec![Value::Int(1), Value::from("two")]),
        Value::Object(object),
    ]
}

/// A thunk exercising every arm of the wire schema at once.
fn kitchen_sink() -> Thunk {
    let archive = ThunkPath::new(producer(), FileOrDirPath::file("image.tar").unwrap()).unwrap();
    let outputs = ThunkPath::new(producer(), FileOrDirPath::dir("out").unwrap()).unwrap();

    Thunk::new(ThunkCmd::File(FilePath::new("entry.sh").unwrap()))
        .with_image(ThunkImage::Ref(
            ImageRef::from_archive(Platform::new("linux", "amd64"), archive)
                .with_tag("v2")
                .with_digest("sha256:abc"),
        ))
        .with_args(every_value())
        .with_env("TERM", "dumb")
        .with_env("ATTEMPT", 3i64)
        .with_dir(DirPath::new("work").unwrap())
        .with_mount(
            MountSource::Thunk(outputs),
            FileOrDirPath::dir("deps").unwrap(),
        )
        .with_mount(
            MountSource::Host(
                HostPath::new("/src/app", FileOrDirPath::dir("src").unwrap()).unwrap(),
            ),
            FileOrDirPath::dir("src").unwrap(),
        )
        .with_mount(
            MountSource::Fs(
                FsPath::new("stdlib", FileOrDirPath::dir("lib").unwrap()).unwrap(),
            ),
            FileOrDirPath::dir("lib").unwrap(),
        )
        .with_mount(
            MountSource::Cache(CachePath::new("go-mod", FileOrDirPath::dir(".").unwrap())),
            FileOrDirPath::dir("/root/.cache/go-mod").unwrap(),
        )
        .with_mount(
            MountSource::Secret(Secret::new("tok", b"xyz".to_vec())),
            FileOrDirPath::file("/run/secrets/tok").unwrap(),
        )
        .with_label("branch", "main")
        .with_insecure(true)
}

#[test]
fn kitchen_sink_round_trips() {
    let thunk = kitchen_sink();

    let encoded = proto::encode_thunk(&thunk).unwrap();
    let decoded = proto::decode_thunk(&encoded).unwrap();

    assert_eq!(thunk, decoded);
    assert_eq!(
        thunk.fingerprint().unwrap(),
        decoded.fingerprint().unwrap()
    );
}

#[test]
fn stdin_values_round_trip() {
    let mut thunk = producer();
    thunk.stdin = every_value();

    let decoded = proto::decode_thunk(&proto::encode_thunk(&thunk).unwrap()).unwrap();
    assert_eq!(thunk, decoded);
}

#[test]
fn parent_image_round_trips() {
    let thunk = Thunk::new(ThunkCmd::Command(CommandPath::new("test").unwrap()))
        .with_image(ThunkImage::Parent(Box::new(producer())));

    let decoded = proto::decode_thunk(&proto::encode_thunk(&thunk).unwrap()).unwrap();
    assert_eq!(thunk, decoded);
}

#[test]
fn host_and_fs_commands_round_trip() {
    let host = Thunk::new(ThunkCmd::Host(
        HostPath::new("/src", FileOrDirPath::file("run.sh").unwrap()).unwrap(),
    ));
    let decoded = proto::decode_thunk(&proto::encode_thunk(&host).unwrap()).unwrap();
    assert_eq!(host, decoded);

    let fs = Thunk::new(ThunkCmd::Fs(
        FsPath::new("stdlib", FileOrDirPath::file("init").unwrap()).unwrap(),
    ));
    let decoded = proto::decode_thunk(&proto::encode_thunk(&fs).unwrap()).unwrap();
    assert_eq!(fs, decoded);

    let tp = Thunk::new(ThunkCmd::Thunk(
        ThunkPath::new(producer(), FileOrDirPath::file("bin/tool").unwrap()).unwrap(),
    ));
    let decoded = proto::decode_thunk(&proto::encode_thunk(&tp).unwrap()).unwrap();
    assert_eq!(tp, decoded);
}

#[test]
fn bindings_encode_sorted_by_name() {
    let thunk = producer()
        .with_env("ZETA", "last")
        .with_env("ALPHA", "first")
        .with_env("MIDDLE", "mid");

    let encoded = proto::thunk_to_proto(&thunk).unwrap();
    let names: Vec<&str> = encoded.env.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(names, ["ALPHA", "MIDDLE", "ZETA"]);
}

#[test]
fn arrays_preserve_insertion_order() {
    let thunk = producer().with_args([Value::from("c"), Value::from("a"), Value::from("b")]);

    let decoded = proto::decode_thunk(&proto::encode_thunk(&thunk).unwrap()).unwrap();
    assert_eq!(decoded.args, thunk.args);
}

#[test]
fn secret_bytes_survive_the_wire() {
    let thunk = producer().with_mount(
        MountSource::Secret(Secret::new("tok", b"wire-bytes".to_vec())),
        FileOrDirPath::file("/run/secrets/tok").unwrap(),
    );

    let decoded = proto::decode_thunk(&proto::encode_thunk(&thunk).unwrap()).unwrap();
    let MountSource::Secret(secret) = &decoded.mounts[0].source else {
        panic!("expected secret mount");
    };
    assert_eq!(secret.reveal(), b"wire-bytes");
}

#[test]
fn empty_cache_id_falls_back_to_the_path() {
    let thunk = producer().with_mount(
        MountSource::Cache(CachePath::new("go-mod", FileOrDirPath::dir("sub").unwrap())),
        FileOrDirPath::dir("cache").unwrap(),
    );

    // Simulate a legacy encoder that never set the id.
    let mut encoded = proto::thunk_to_proto(&thunk).unwrap();
    let Some(proto::thunk_mount_source::Source::Cache(cache)) = encoded.mounts[0]
        .source
        .as_mut()
        .and_then(|s| s.source.as_mut())
    else {
        panic!("expected cache mount");
    };
    cache.id = String::new();

    let decoded = proto::thunk_from_proto(&encoded).unwrap();
    let MountSource::Cache(cache) = &decoded.mounts[0].source else {
        panic!("expected cache mount");
    };
    assert_eq!(cache.id, "sub");
}

#[test]
fn missing_required_fields_are_decode_errors() {
    let encoded = proto::Thunk::default();
    assert!(matches!(
        proto::thunk_from_proto(&encoded),
        Err(thunkrun::Error::WireMissing { .. })
    ));
}

#[test]
fn archless_platform_round_trips_as_any() {
    let thunk = producer();
    let encoded = proto::thunk_to_proto(&thunk).unwrap();

    let Some(proto::thunk_image::Image::Ref(image_ref)) =
        encoded.image.as_ref().and_then(|i| i.image.as_ref())
    else {
        panic!("expected ref image");
    };
    assert_eq!(image_ref.platform.as_ref().unwrap().arch, "");

    let decoded = proto::thunk_from_proto(&encoded).unwrap();
    assert_eq!(decoded.platform().unwrap().arch, None);
}
