use crate::detectors::EventCandidate;
use std::cmp::Ordering;

fn by_time(a: &EventCandidate, b: &EventCandidate) -> Ordering {
    a.start_time
        .total_cmp(&b.start_time)
        .then(a.end_time.total_cmp(&b.end_time))
}

/// Stitch events cut by a chunk boundary back together.
///
/// `events` must be in chunk order. An event that opens its chunk continues
/// whatever event of the previous chunk was still running at that point: a
/// head cut by the previous chunk's end is joined with it, a head that closed
/// inside the overlap already holds the whole event and absorbs it.
pub fn join_chunk_edges(events: Vec<EventCandidate>) -> Vec<EventCandidate> {
    // (last chunk the event reached, event so far)
    let mut joined: Vec<(usize, EventCandidate)> = Vec::with_capacity(events.len());
    for event in events {
        let head = if event.edges.at_start {
            joined.iter_mut().rev().find(|entry| {
                let (last, head) = &**entry;
                *last + 1 == event.chunk_index
                    && head.event_type == event.event_type
                    && head.end_time > event.start_time
            })
        } else {
            None
        };
        match head {
            Some((last, head)) if head.edges.at_end => {
                *head = head.joined_with(&event);
                *last = event.chunk_index;
            }
            Some(_) => {}
            None => joined.push((event.chunk_index, event)),
        }
    }
    joined.into_iter().map(|(_, event)| event).collect()
}

/// Merge candidates reported by overlapping chunks.
///
/// Two events are the same when their overlap exceeds `max_ratio` of the
/// longer one. Of a group of duplicates the longest survives. The output is
/// sorted by start time and contains no duplicate pair, so running it twice
/// changes nothing.
pub fn deduplicate(mut events: Vec<EventCandidate>, max_ratio: f64) -> Vec<EventCandidate> {
    events.sort_by(by_time);
    let mut accepted: Vec<EventCandidate> = Vec::with_capacity(events.len());
    for candidate in events {
        let matches: Vec<usize> = accepted
            .iter()
            .enumerate()
            .filter(|(_, kept)| kept.overlap_ratio(&candidate) > max_ratio)
            .map(|(idx, _)| idx)
            .collect();
        if matches.is_empty() {
            accepted.push(candidate);
            continue;
        }
        let longer_than_all = matches
            .iter()
            .all(|&idx| candidate.duration > accepted[idx].duration);
        if longer_than_all {
            for idx in matches.into_iter().rev() {
                accepted.remove(idx);
            }
            accepted.push(candidate);
        }
    }
    accepted.sort_by(by_time);
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::EventType;

    fn ev(start: f64, end: f64) -> EventCandidate {
        EventCandidate::bare(EventType::Apnea, start, end)
    }

    fn cut(chunk: usize, start: f64, end: f64, at_start: bool, at_end: bool) -> EventCandidate {
        let mut event = ev(start, end);
        event.chunk_index = chunk;
        event.edges.at_start = at_start;
        event.edges.at_end = at_end;
        event
    }

    #[test]
    fn halves_across_a_boundary_are_joined() {
        let out = join_chunk_edges(vec![
            cut(0, 40.0, 55.0, false, false),
            cut(0, 230.0, 300.0, false, true),
            cut(1, 240.0, 330.0, true, false),
            cut(1, 400.0, 420.0, false, false),
        ]);
        let spans: Vec<(f64, f64)> = out.iter().map(|e| (e.start_time, e.end_time)).collect();
        assert_eq!(spans, vec![(40.0, 55.0), (230.0, 330.0), (400.0, 420.0)]);
        assert_eq!(out[1].duration, 100.0);
        assert_eq!(out[1].chunk_index, 0);
    }

    #[test]
    fn event_spanning_three_chunks_is_joined_once() {
        let out = join_chunk_edges(vec![
            cut(0, 100.0, 300.0, false, true),
            cut(1, 240.0, 540.0, true, true),
            cut(2, 480.0, 610.0, true, false),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].start_time, out[0].end_time), (100.0, 610.0));
        assert!(!out[0].edges.at_end);
    }

    #[test]
    fn truncated_copy_of_a_closed_event_is_absorbed() {
        // Chunk 0 saw the whole event; chunk 1 only its last 12 s.
        let out = join_chunk_edges(vec![
            cut(0, 200.0, 252.0, false, false),
            cut(1, 240.0, 252.0, true, false),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].start_time, out[0].end_time), (200.0, 252.0));
    }

    #[test]
    fn opening_event_without_a_head_is_kept() {
        let mut hypopnea = cut(0, 230.0, 300.0, false, true);
        hypopnea.event_type = EventType::Hypopnea;
        let out = join_chunk_edges(vec![
            hypopnea,
            cut(0, 100.0, 120.0, false, false),
            cut(1, 240.0, 260.0, true, false),
            cut(2, 480.0, 500.0, true, false),
            cut(3, 720.0, 735.0, true, false),
        ]);
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn keeps_the_longer_duplicate() {
        let out = deduplicate(vec![ev(100.0, 112.0), ev(101.0, 115.0)], 0.5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start_time, 101.0);

        let out = deduplicate(vec![ev(100.0, 120.0), ev(102.0, 114.0)], 0.5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].end_time, 120.0);
    }

    #[test]
    fn distinct_events_survive() {
        let out = deduplicate(
            vec![ev(200.0, 215.0), ev(100.0, 112.0), ev(110.0, 130.0)],
            0.5,
        );
        let starts: Vec<f64> = out.iter().map(|e| e.start_time).collect();
        assert_eq!(starts, vec![100.0, 110.0, 200.0]);
    }

    #[test]
    fn long_event_absorbs_both_halves() {
        // The long event duplicates both short ones.
        let out = deduplicate(vec![ev(0.0, 12.0), ev(11.0, 23.0), ev(0.0, 23.0)], 0.5);
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].start_time, out[0].end_time), (0.0, 23.0));
    }

    #[test]
    fn is_idempotent() {
        let raw = vec![
            ev(0.0, 12.0),
            ev(11.0, 23.0),
            ev(5.0, 30.0),
            ev(29.0, 41.0),
            ev(40.0, 52.0),
            ev(300.0, 310.0),
            ev(301.0, 310.0),
        ];
        let once = deduplicate(raw, 0.5);
        let twice = deduplicate(once.clone(), 0.5);
        assert_eq!(once, twice);
        for (i, a) in once.iter().enumerate() {
            for b in &once[i + 1..] {
                assert!(a.overlap_ratio(b) <= 0.5);
            }
        }
    }
}
