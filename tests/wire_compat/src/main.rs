fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use serde::Deserialize;
    use watchmqtt_protocol::{Packet, QoS, classify, encode_connect, encode_subscribe, split_frames};

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads and deserializes a fixture file.
    fn load_fixture<T: serde::de::DeserializeOwned>(name: &str) -> T {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    fn bytes(name: &str, hex_str: &str) -> Vec<u8> {
        hex::decode(hex_str).unwrap_or_else(|e| panic!("bad hex in fixture {name}: {e}"))
    }

    #[derive(Debug, Deserialize)]
    #[serde(tag = "packet", rename_all = "lowercase")]
    enum EncodeCase {
        Connect {
            name: String,
            client_id: String,
            username: String,
            password: String,
            keep_alive: u16,
            hex: String,
        },
        Subscribe {
            name: String,
            packet_id: u16,
            topic: String,
            hex: String,
        },
    }

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(tag = "type", rename_all = "lowercase")]
    enum Expected {
        Connack { return_code: u8 },
        Publish { topic: String, payload: String },
        Unrecognized,
    }

    impl Expected {
        fn matches(&self, packet: &Packet) -> bool {
            match (self, packet) {
                (Expected::Connack { return_code }, Packet::Connack { return_code: got }) => {
                    *return_code == got.as_u8()
                }
                (Expected::Publish { topic, payload }, Packet::Publish { topic: t, payload: p }) => {
                    topic == t && payload.as_bytes() == p.as_slice()
                }
                (Expected::Unrecognized, Packet::Unrecognized { .. }) => true,
                _ => false,
            }
        }
    }

    #[derive(Debug, Deserialize)]
    struct ClassifyCase {
        name: String,
        hex: String,
        expect: Expected,
    }

    #[derive(Debug, Deserialize)]
    struct SplitCase {
        name: String,
        hex: String,
        expect: Vec<Expected>,
    }

    #[test]
    fn encoders_match_golden_bytes() {
        let cases: Vec<EncodeCase> = load_fixture("encode.json");
        assert!(!cases.is_empty());

        for case in cases {
            let (name, encoded, hex_str) = match &case {
                EncodeCase::Connect {
                    name,
                    client_id,
                    username,
                    password,
                    keep_alive,
                    hex,
                } => (
                    name,
                    encode_connect(client_id, username, password, *keep_alive),
                    hex,
                ),
                EncodeCase::Subscribe {
                    name,
                    packet_id,
                    topic,
                    hex,
                } => (
                    name,
                    encode_subscribe(*packet_id, topic, QoS::AtMostOnce),
                    hex,
                ),
            };
            let encoded = encoded.unwrap_or_else(|e| panic!("{name}: encode failed: {e}"));
            assert_eq!(
                hex::encode(&encoded),
                *hex_str,
                "byte mismatch for {name}"
            );
        }
    }

    #[test]
    fn packet_encode_matches_golden_bytes() {
        let cases: Vec<EncodeCase> = load_fixture("encode.json");
        for case in cases {
            let (name, packet, hex_str) = match case {
                EncodeCase::Connect {
                    name,
                    client_id,
                    username,
                    password,
                    keep_alive,
                    hex,
                } => (
                    name,
                    Packet::Connect {
                        client_id,
                        username,
                        password,
                        keep_alive,
                    },
                    hex,
                ),
                EncodeCase::Subscribe {
                    name,
                    packet_id,
                    topic,
                    hex,
                } => (
                    name,
                    Packet::Subscribe {
                        packet_id,
                        topic_filter: topic,
                        requested_qos: QoS::AtMostOnce,
                    },
                    hex,
                ),
            };
            let encoded = packet
                .encode()
                .unwrap_or_else(|e| panic!("{name}: encode failed: {e}"));
            assert_eq!(encoded, bytes(&name, &hex_str), "byte mismatch for {name}");
        }
    }

    #[test]
    fn classify_matches_fixtures() {
        let cases: Vec<ClassifyCase> = load_fixture("classify.json");
        assert!(!cases.is_empty());

        for case in cases {
            let packet = classify(&bytes(&case.name, &case.hex));
            assert!(
                case.expect.matches(&packet),
                "{}: expected {:?}, got {packet:?}",
                case.name,
                case.expect
            );
        }
    }

    #[test]
    fn split_frames_matches_fixtures() {
        let cases: Vec<SplitCase> = load_fixture("split.json");
        assert!(!cases.is_empty());

        for case in cases {
            let buf = bytes(&case.name, &case.hex);
            let packets: Vec<Packet> = split_frames(&buf).collect();
            assert_eq!(
                packets.len(),
                case.expect.len(),
                "{}: got {packets:?}",
                case.name
            );
            for (expected, packet) in case.expect.iter().zip(&packets) {
                assert!(
                    expected.matches(packet),
                    "{}: expected {expected:?}, got {packet:?}",
                    case.name
                );
            }
        }
    }
}
