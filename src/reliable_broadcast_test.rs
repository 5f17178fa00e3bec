use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::{json, Value};
use test_case::test_case;

use crate::quorum::Quorum;
use crate::reliable_broadcast::{RbOutput, RbPhase, ReliableBroadcast};
use crate::types::ParticipantId;

fn payload(value: u64) -> Value {
    json!({ "v": value })
}

fn deliveries(output: &[RbOutput<Value>]) -> Vec<&Value> {
    output
        .iter()
        .filter_map(|step| match step {
            RbOutput::Deliver(payload) => Some(payload),
            RbOutput::Broadcast(_, _) => None,
        })
        .collect()
}

/// Feed the echo quorum followed by the ready quorum and check the payload
/// is delivered exactly once, on the last ready.
fn sanity_check(n: usize) {
    let quorum = Quorum::new(n);
    let f = quorum.max_faulty();
    let mut rb = ReliableBroadcast::new(quorum);

    let output = rb.broadcast(payload(0));
    assert_eq!(output, vec![RbOutput::Broadcast(RbPhase::Init, payload(0))]);

    for sender in 0..n - f {
        let output = rb.process(sender, RbPhase::Echo, payload(0));
        assert!(deliveries(&output).is_empty(), "n={n} sender={sender}");
    }

    for sender in 0..n - f - 1 {
        let output = rb.process(sender, RbPhase::Ready, payload(0));
        assert!(deliveries(&output).is_empty(), "n={n} sender={sender}");
    }

    let output = rb.process(n - f - 1, RbPhase::Ready, payload(0));
    assert_eq!(deliveries(&output), vec![&payload(0)]);
    assert!(rb.is_delivered(&payload(0)));
}

#[test]
fn delivers_after_ready_quorum() {
    for n in (4..50).step_by(3) {
        sanity_check(n);
    }
}

#[test]
fn echo_quorum_turns_ready_without_delivery() {
    // n = 4, f = 1: three echoes reach the echo quorum, three readies
    // deliver.
    let mut rb = ReliableBroadcast::new(Quorum::new(4));
    rb.broadcast(payload(0));

    let mut readied = false;
    for sender in [0, 1, 2] {
        let output = rb.process(sender, RbPhase::Echo, payload(0));
        assert!(deliveries(&output).is_empty());
        readied |= output
            .iter()
            .any(|step| matches!(step, RbOutput::Broadcast(RbPhase::Ready, _)));
    }
    assert!(readied, "echo quorum must trigger the ready broadcast");
    assert!(!rb.is_delivered(&payload(0)));

    for sender in [0, 1] {
        assert!(deliveries(&rb.process(sender, RbPhase::Ready, payload(0))).is_empty());
    }
    let output = rb.process(2, RbPhase::Ready, payload(0));
    assert_eq!(deliveries(&output), vec![&payload(0)]);
}

#[test]
fn f_plus_one_readies_amplify() {
    // A participant that saw no echoes still echoes the ready wave once
    // f + 1 distinct senders vouch for it.
    // n = 7, f = 2.
    let mut rb = ReliableBroadcast::new(Quorum::new(7));

    assert!(rb.process(0, RbPhase::Ready, payload(3)).is_empty());
    assert!(rb.process(1, RbPhase::Ready, payload(3)).is_empty());
    let output = rb.process(2, RbPhase::Ready, payload(3));
    assert_eq!(output, vec![RbOutput::Broadcast(RbPhase::Ready, payload(3))]);
}

#[test]
fn duplicate_senders_are_counted_once() {
    let mut rb = ReliableBroadcast::new(Quorum::new(4));
    rb.broadcast(payload(0));

    for _ in 0..10 {
        let output = rb.process(0, RbPhase::Echo, payload(0));
        assert!(output.is_empty());
    }
    assert!(!rb.is_delivered(&payload(0)));
}

#[test]
fn delivered_instances_ignore_further_input() {
    let n = 4;
    let mut rb = ReliableBroadcast::new(Quorum::new(n));
    rb.broadcast(payload(0));
    for sender in 0..3 {
        rb.process(sender, RbPhase::Ready, payload(0));
    }
    assert!(rb.is_delivered(&payload(0)));

    // A late ready from a fresh sender must not re-deliver.
    assert!(rb.process(3, RbPhase::Ready, payload(0)).is_empty());
    assert!(rb.process(3, RbPhase::Echo, payload(0)).is_empty());
    assert!(rb.process(3, RbPhase::Init, payload(0)).is_empty());
}

#[test]
fn shuffled_input_still_delivers() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    for n in (4..50).step_by(3) {
        let quorum = Quorum::new(n);
        let f = quorum.max_faulty();
        let mut rb = ReliableBroadcast::new(quorum);
        rb.broadcast(payload(0));

        let mut messages: Vec<(ParticipantId, RbPhase)> = Vec::new();
        for sender in 0..n - f {
            messages.push((sender, RbPhase::Echo));
            messages.push((sender, RbPhase::Ready));
        }
        messages.shuffle(&mut rng);

        for (sender, phase) in messages {
            rb.process(sender, phase, payload(0));
        }
        assert!(rb.is_delivered(&payload(0)), "n={n}");
    }
}

#[test_case(0, 1, 2)]
#[test_case(3, 4, 5)]
fn concurrent_broadcasts_stay_separate(a: u64, b: u64, c: u64) {
    let n = 10;
    let quorum = Quorum::new(n);
    let f = quorum.max_faulty();
    let mut rb = ReliableBroadcast::new(quorum);

    for value in [a, b, c] {
        rb.broadcast(payload(value));
    }

    // Readies for `a` and `b` only; `c` must stay undelivered.
    for value in [a, b] {
        for sender in 0..n - f {
            rb.process(sender, RbPhase::Ready, payload(value));
        }
    }
    assert!(rb.is_delivered(&payload(a)));
    assert!(rb.is_delivered(&payload(b)));
    assert!(!rb.is_delivered(&payload(c)));
}

#[test]
fn broadcast_started_by_peers_before_own_echo() {
    // Echo traffic can arrive before this participant hears the init; the
    // instance forms on first contact and still completes.
    let n = 10;
    let quorum = Quorum::new(n);
    let f = quorum.max_faulty();
    let mut rb = ReliableBroadcast::new(quorum);

    for sender in 0..n - f {
        rb.process(sender, RbPhase::Echo, payload(9));
    }
    for sender in 0..n - f {
        rb.process(sender, RbPhase::Ready, payload(9));
    }
    assert!(rb.is_delivered(&payload(9)));
}
