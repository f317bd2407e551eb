use dchyper::hyper::connection::FrameReader;
use dchyper::hyper::protocol::{FileCheckResult, Handshake, Message, Request, SegmentData};
use dchyper::hyper::{BufferPool, PooledBuf};
use dchyper::Role;
use proptest::prelude::*;

const POOL_BUF: usize = 4096;

fn message() -> impl Strategy<Value = Message> {
    prop_oneof![
        (any::<i64>(), any::<bool>()).prop_map(|(session_token, control)| {
            Message::Handshake(Handshake {
                session_token,
                role: Role::from_control_flag(control),
            })
        }),
        (any::<u32>(), any::<i64>())
            .prop_map(|(token, size)| Message::FileCheckResult(FileCheckResult { token, size })),
        (any::<u32>(), "\\PC{0,120}", any::<i64>(), prop_oneof![Just(-1i32), any::<i32>()]).prop_map(
            |(token, path, offset, length)| {
                Message::Request(Request {
                    token,
                    path,
                    offset,
                    length,
                })
            }
        ),
        (any::<u32>(), prop::collection::vec(any::<u8>(), 0..=POOL_BUF)).prop_map(|(token, data)| {
            Message::SegmentData(SegmentData {
                token,
                data: PooledBuf::from_vec(data),
            })
        }),
    ]
}

/// Split `bytes` at the given fractions into non-empty chunks.
fn split(bytes: &[u8], cuts: &[prop::sample::Index]) -> Vec<Vec<u8>> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c.index(bytes.len().max(1))).collect();
    points.push(0);
    points.push(bytes.len());
    points.sort_unstable();
    points.dedup();
    points
        .windows(2)
        .map(|w| bytes[w[0]..w[1]].to_vec())
        .filter(|c| !c.is_empty())
        .collect()
}

proptest! {
    #[test]
    fn prop_frame_round_trip(msg in message()) {
        let encoded = msg.encode();
        let (decoded, used) = Message::decode_frame(&encoded).unwrap();
        prop_assert_eq!(used, encoded.len());
        prop_assert_eq!(decoded, msg);
    }

    #[test]
    fn prop_chunked_reassembly(
        msgs in prop::collection::vec(message(), 1..8),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..32),
    ) {
        let pool = BufferPool::new(POOL_BUF, 4);
        let mut reader = FrameReader::new(pool.clone());
        let stream: Vec<u8> = msgs.iter().flat_map(|m| m.encode().to_vec()).collect();

        let mut out = Vec::new();
        for chunk in split(&stream, &cuts) {
            let before = out.len();
            reader.feed(&chunk, &mut out).unwrap();
            // Whatever was emitted is a whole prefix of the input messages.
            prop_assert!(out.len() >= before);
            prop_assert_eq!(&out[..], &msgs[..out.len()]);
        }

        prop_assert_eq!(&out, &msgs);
        prop_assert_eq!(reader.buffered(), 0);
        drop(out);
        prop_assert_eq!(pool.outstanding(), 0);
    }
}
