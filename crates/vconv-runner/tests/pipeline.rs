//! Pipeline-discipline tests over the stage queues and carry store.

use vconv_models::{Stage, Task};
use vconv_runner::queue::QueueConfig;
use vconv_runner::{CarryStore, StageQueues};

fn task(id: &str, priority: i64) -> Task {
    Task::new(id, format!("http://src/{}.mp4", id)).with_priority(priority)
}

/// Walk one task through all three stages, recording which task occupied
/// each stage slot in order.
fn drain_pipeline(queue: &StageQueues, log: &mut Vec<(Stage, String)>) {
    loop {
        let mut moved = false;

        if let Some(t) = queue.next_download() {
            log.push((Stage::Download, t.id.clone()));
            queue.complete_download(t);
            moved = true;
        }
        if let Some(t) = queue.next_convert() {
            log.push((Stage::Convert, t.id.clone()));
            queue.complete_convert(t);
            moved = true;
        }
        if let Some(t) = queue.next_upload() {
            log.push((Stage::Upload, t.id.clone()));
            queue.complete_upload(&t.id);
            moved = true;
        }

        if !moved {
            break;
        }
    }
}

#[test]
fn capacity_one_forbids_interleaving_within_a_stage() {
    let queue = StageQueues::new(QueueConfig::default());
    for id in ["t1", "t2", "t3"] {
        assert!(queue.add(task(id, 0)));
    }

    // With a cap of one, a second pop in the same stage must fail while
    // the first task is in flight.
    let first = queue.next_download().unwrap();
    assert!(queue.next_download().is_none());
    let stats = queue.stats();
    assert_eq!(stats.download.in_flight, 1);

    queue.complete_download(first);
    let second = queue.next_download().unwrap();
    assert_eq!(second.id, "t2");
}

#[test]
fn equal_priority_tasks_complete_in_arrival_order() {
    let queue = StageQueues::new(QueueConfig::default());
    for id in ["t1", "t2", "t3"] {
        queue.add(task(id, 0));
    }

    let mut log = Vec::new();
    drain_pipeline(&queue, &mut log);

    let uploads: Vec<&str> = log
        .iter()
        .filter(|(stage, _)| *stage == Stage::Upload)
        .map(|(_, id)| id.as_str())
        .collect();
    assert_eq!(uploads, ["t1", "t2", "t3"]);
}

#[test]
fn higher_priority_overtakes_within_the_download_queue() {
    let queue = StageQueues::new(QueueConfig::default());
    queue.add(task("lo", 0));
    queue.add(task("hi", 100));

    assert_eq!(queue.next_download().unwrap().id, "hi");
}

#[test]
fn at_most_one_stage_holds_a_task() {
    let queue = StageQueues::new(QueueConfig::default());
    queue.add(task("t1", 0));

    let t = queue.next_download().unwrap();
    queue.complete_download(t);

    // In the convert queue now; no stage may accept it again.
    assert!(!queue.add(task("t1", 0)));
    let stats = queue.stats();
    let total = stats.download.waiting
        + stats.download.in_flight
        + stats.convert.waiting
        + stats.convert.in_flight
        + stats.upload.waiting
        + stats.upload.in_flight;
    assert_eq!(total, 1);
}

#[test]
fn terminal_failure_clears_queue_and_carry() {
    let queue = StageQueues::new(QueueConfig::default());
    let carry = CarryStore::new();

    queue.add(task("t1", 0));
    carry.insert("t1");

    let t = queue.next_download().unwrap();
    carry.set_downloaded("t1", "/tmp/videoconverter/t1/source.mp4".into());
    queue.complete_download(t);
    queue.next_convert().unwrap();

    // Encoder blew up mid-convert.
    assert!(queue.fail("t1", Stage::Convert));
    carry.remove("t1");

    assert_eq!(queue.stats(), Default::default());
    assert!(carry.get("t1").is_none());
    // The id is free again, e.g. after a control-plane retry.
    assert!(queue.add(task("t1", 0)));
}

#[test]
fn carry_holds_what_the_next_stage_needs() {
    let queue = StageQueues::new(QueueConfig::default());
    let carry = CarryStore::new();

    queue.add(task("t1", 0));
    carry.insert("t1");

    let t = queue.next_download().unwrap();
    carry.set_downloaded("t1", "/tmp/videoconverter/t1/a.mp4".into());
    queue.complete_download(t);

    // Entering convert: the downloaded path must be present.
    let t = queue.next_convert().unwrap();
    let entry = carry.get(&t.id).unwrap();
    assert!(entry.downloaded_file_path.is_some());

    carry.set_converted("t1", "/tmp/videoconverter/t1_converted.mp4".into(), 42.0, 900_000);
    queue.complete_convert(t);

    // Entering upload: the converted path must be present.
    let t = queue.next_upload().unwrap();
    let entry = carry.get(&t.id).unwrap();
    assert!(entry.converted_file_path.is_some());
    assert_eq!(entry.converted_duration, Some(42.0));
}
