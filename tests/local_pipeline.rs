//! End-to-end pipeline runs over the local backend.
//!
//! These tests drive the real worker loop (dispatcher, runner,
//! heartbeat, all four stages) against a directory-backed backend, with
//! a scripted stand-in for the OCR binary that emits valid hOCR whose
//! confidence depends on the binarisation threshold.

use std::{path::Path, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use bookpipe::{
    backend::{Backend, QueueKind, local::LocalBackend},
    config::Settings,
    notify::{LogRing, LogSink},
    worker::{ShutdownWhenIdle, Worker},
};

/// A fake OCR tool: writes an hOCR file whose word confidence depends
/// on the variant threshold, so best-selection has something to choose.
/// Exits non-zero for any input whose name contains `poison`.
fn fake_ocr(dir: &Path) -> String {
    let script = dir.join("fake-ocr.sh");
    let body = r#"#!/bin/sh
case "$1" in
  *poison*) echo "cannot read page" >&2; exit 1 ;;
esac
conf=50
case "$1" in
  *_bin0.2*) conf=90 ;;
  *_bin0.4*) conf=75 ;;
  *_bin0.0*) conf=80 ;;
esac
printf '%s\n' \
  "<div class='ocr_page' title='bbox 0 0 200 200'>" \
  "<span class='ocrx_word' title='bbox 10 10 60 30; x_wconf $conf'>word</span>" \
  "</div>" > "$2.hocr"
"#;
    std::fs::write(&script, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    script.to_string_lossy().into_owned()
}

fn page_image() -> image::GrayImage {
    let mut img = image::GrayImage::from_pixel(120, 120, image::Luma([255]));
    for y in 40..80 {
        for x in 20..100 {
            img.put_pixel(x, y, image::Luma([10]));
        }
    }
    img
}

fn settings(stages: Vec<QueueKind>, ocr_command: String) -> Arc<Settings> {
    Arc::new(Settings {
        lease: Duration::from_secs(30),
        poll_interval: Duration::from_millis(50),
        idle_shutdown: Duration::from_millis(400),
        default_training: "eng".to_owned(),
        enabled: stages,
        ocr_command,
        ..Settings::default()
    })
}

/// Run a worker until its queues go quiet.
async fn run_to_idle(backend: Arc<LocalBackend>, settings: Arc<Settings>) {
    let worker = Worker::new(
        backend,
        settings,
        Arc::new(LogSink),
        LogRing::new(),
        Box::new(ShutdownWhenIdle),
    );
    tokio::time::timeout(Duration::from_secs(120), worker.run(CancellationToken::new()))
        .await
        .expect("worker did not reach idle")
        .expect("worker failed");
}

async fn book_keys(backend: &LocalBackend, book: &str) -> Vec<String> {
    let mut keys: Vec<String> = backend
        .list(&format!("{book}/"))
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.key)
        .collect();
    keys.sort();
    keys
}

/// Single page through preprocess → OCR → analyse: four binarised
/// variants, four hOCRs, manifests and PDFs, but no graph for a
/// one-page book.
#[tokio::test]
async fn single_page_happy_path() {
    let dir = tempfile::TempDir::new().unwrap();
    let backend = Arc::new(LocalBackend::new(&dir.path().join("root")).await.unwrap());
    let ocr = fake_ocr(dir.path());

    let jpg = dir.path().join("0001.jpg");
    image::DynamicImage::ImageLuma8(page_image())
        .to_rgb8()
        .save(&jpg)
        .unwrap();
    backend.put("book1/0001.jpg", &jpg).await.unwrap();
    backend.enqueue(QueueKind::Preprocess, "book1").await.unwrap();

    run_to_idle(
        backend.clone(),
        settings(
            vec![QueueKind::Preprocess, QueueKind::PageOcr, QueueKind::Analyse],
            ocr,
        ),
    )
    .await;

    let keys = book_keys(&backend, "book1").await;
    for expected in [
        "book1/0001_bin0.1.png",
        "book1/0001_bin0.2.png",
        "book1/0001_bin0.4.png",
        "book1/0001_bin0.5.png",
        "book1/0001_bin0.1.hocr",
        "book1/0001_bin0.2.hocr",
        "book1/0001_bin0.4.hocr",
        "book1/0001_bin0.5.hocr",
        "book1/best",
        "book1/conf",
        "book1/book1.binarised.pdf",
        "book1/book1.colour.pdf",
    ] {
        assert!(keys.contains(&expected.to_owned()), "missing {expected}: {keys:?}");
    }
    // One page: no confidence graph, so no completion marker either.
    assert!(!keys.contains(&"book1/graph.png".to_owned()));

    let fetched = dir.path().join("best");
    backend.get("book1/best", &fetched).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(&fetched).unwrap(),
        "0001_bin0.2.hocr\n",
        "best must name the highest-confidence variant"
    );

    let fetched = dir.path().join("conf");
    backend.get("book1/conf", &fetched).await.unwrap();
    let conf = std::fs::read_to_string(&fetched).unwrap();
    assert_eq!(conf.lines().count(), 4);
    assert!(conf.contains("book1/0001_bin0.2.hocr\t90.00"));

    // Every queue drained.
    for queue in QueueKind::ALL {
        let stats = backend.stats(queue).await.unwrap();
        assert_eq!((stats.available, stats.in_flight), (0, 0), "queue {queue}");
    }
}

/// Two already-binarised pages through wipe → OCR → analyse: a
/// two-point graph appears and marks the book done, and re-running
/// analyse is byte-stable.
#[tokio::test]
async fn wipe_path_produces_graph_and_is_idempotent() {
    let dir = tempfile::TempDir::new().unwrap();
    let backend = Arc::new(LocalBackend::new(&dir.path().join("root")).await.unwrap());
    let ocr = fake_ocr(dir.path());

    for name in ["0001.png", "0002.png"] {
        let png = dir.path().join(name);
        page_image().save(&png).unwrap();
        backend.put(&format!("book2/{name}"), &png).await.unwrap();
    }
    backend.enqueue(QueueKind::Wipeonly, "book2").await.unwrap();

    let stages = vec![QueueKind::Wipeonly, QueueKind::PageOcr, QueueKind::Analyse];
    run_to_idle(backend.clone(), settings(stages.clone(), ocr.clone())).await;

    let keys = book_keys(&backend, "book2").await;
    for expected in [
        "book2/0001_bin0.0.png",
        "book2/0002_bin0.0.png",
        "book2/0001_bin0.0.hocr",
        "book2/0002_bin0.0.hocr",
        "book2/best",
        "book2/conf",
        "book2/book2.binarised.pdf",
        "book2/book2.colour.pdf",
        "book2/graph.png",
    ] {
        assert!(keys.contains(&expected.to_owned()), "missing {expected}: {keys:?}");
    }

    let best = dir.path().join("best");
    backend.get("book2/best", &best).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(&best).unwrap(),
        "0001_bin0.0.hocr\n0002_bin0.0.hocr\n"
    );

    // Idempotence: analysing the same book again rewrites identical
    // manifests.
    let conf = dir.path().join("conf");
    backend.get("book2/conf", &conf).await.unwrap();
    let first_conf = std::fs::read(&conf).unwrap();

    backend.enqueue(QueueKind::Analyse, "book2").await.unwrap();
    run_to_idle(backend.clone(), settings(stages, ocr)).await;

    backend.get("book2/conf", &conf).await.unwrap();
    assert_eq!(std::fs::read(&conf).unwrap(), first_conf);
}

/// A page the OCR tool can never read: its message is deleted rather
/// than retried, and the book never reaches analyse.
#[tokio::test]
async fn deterministic_ocr_failure_stops_the_book() {
    let dir = tempfile::TempDir::new().unwrap();
    let backend = Arc::new(LocalBackend::new(&dir.path().join("root")).await.unwrap());
    let ocr = fake_ocr(dir.path());

    for name in ["0001.png", "poison.png"] {
        let png = dir.path().join(name);
        page_image().save(&png).unwrap();
        backend.put(&format!("book3/{name}"), &png).await.unwrap();
    }
    backend.enqueue(QueueKind::Wipeonly, "book3").await.unwrap();

    run_to_idle(
        backend.clone(),
        settings(
            vec![QueueKind::Wipeonly, QueueKind::PageOcr, QueueKind::Analyse],
            ocr,
        ),
    )
    .await;

    let keys = book_keys(&backend, "book3").await;
    // The good page OCRed; the poisoned one did not.
    assert!(keys.contains(&"book3/0001_bin0.0.hocr".to_owned()));
    assert!(!keys.contains(&"book3/poison_bin0.0.hocr".to_owned()));
    // No analyse artifacts for an incomplete book.
    assert!(!keys.contains(&"book3/best".to_owned()));
    assert!(!keys.contains(&"book3/graph.png".to_owned()));

    // The failing message was deleted, not left to spin.
    for queue in QueueKind::ALL {
        let stats = backend.stats(queue).await.unwrap();
        assert_eq!((stats.available, stats.in_flight), (0, 0), "queue {queue}");
    }
}
