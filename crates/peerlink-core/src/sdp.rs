//! Session description patching

/// Bandwidth requested for data sections when the channel runs the
/// reliable overlay
pub const RELIABLE_BANDWIDTH_KBPS: u32 = 102_400;

/// Request a higher application bandwidth by setting a `b=AS` line in every
/// `m=application` section, replacing an existing one if present.
pub fn higher_bandwidth_sdp(sdp: &str) -> String {
    let line_end = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let bandwidth = format!("b=AS:{}", RELIABLE_BANDWIDTH_KBPS);

    let mut out: Vec<String> = Vec::new();
    let mut in_application = false;
    let mut patched = false;

    for line in sdp.lines() {
        if line.starts_with("m=") {
            in_application = line.starts_with("m=application");
            patched = false;
            out.push(line.to_string());
            continue;
        }
        if in_application && !patched {
            if line.starts_with("b=AS:") {
                out.push(bandwidth.clone());
                patched = true;
                continue;
            }
            // b= lines follow c= lines; insert before the first attribute
            if line.starts_with("a=") {
                out.push(bandwidth.clone());
                patched = true;
            }
        }
        out.push(line.to_string());
    }
    if in_application && !patched {
        out.push(bandwidth);
    }

    let mut result = out.join(line_end);
    if sdp.ends_with('\n') {
        result.push_str(line_end);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserts_bandwidth_line() {
        let sdp = "v=0\r\nm=audio 9 UDP 0\r\na=rtpmap:0 PCMU/8000\r\nm=application 9 DTLS/SCTP 5000\r\nc=IN IP4 0.0.0.0\r\na=sctpmap:5000 webrtc-datachannel 1024\r\n";
        let patched = higher_bandwidth_sdp(sdp);
        assert_eq!(
            patched,
            "v=0\r\nm=audio 9 UDP 0\r\na=rtpmap:0 PCMU/8000\r\nm=application 9 DTLS/SCTP 5000\r\nc=IN IP4 0.0.0.0\r\nb=AS:102400\r\na=sctpmap:5000 webrtc-datachannel 1024\r\n"
        );
    }

    #[test]
    fn test_replaces_existing_bandwidth() {
        let sdp = "v=0\nm=application 9 DTLS/SCTP 5000\nb=AS:30\na=setup:actpass\n";
        let patched = higher_bandwidth_sdp(sdp);
        assert_eq!(
            patched,
            "v=0\nm=application 9 DTLS/SCTP 5000\nb=AS:102400\na=setup:actpass\n"
        );
    }

    #[test]
    fn test_no_application_section() {
        let sdp = "v=0\nm=audio 9 UDP 0\n";
        assert_eq!(higher_bandwidth_sdp(sdp), sdp);
    }
}
