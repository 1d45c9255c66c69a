//! Video codec filtering for outgoing offers.

use picamera_core::CodecType;

const LINE_END: &str = "\r\n";

/// Strip every video codec except `keep` from `sdp`: its `rtpmap`, `rtcp-fb`
/// and `fmtp` attributes, the RTX payload bound to it (`apt=`), and the
/// payload types on the `m=video` line.
pub fn keep_only_codec(sdp: &str, keep: CodecType) -> String {
    let mut lines: Vec<String> = sdp.split(LINE_END).map(str::to_owned).collect();
    for codec in CodecType::ALL {
        if codec != keep {
            remove_codec(&mut lines, codec);
        }
    }
    lines.join(LINE_END)
}

fn remove_codec(lines: &mut Vec<String>, codec: CodecType) {
    let clock = format!("{}/90000", codec.encoding_name());

    while let Some(pt) = lines
        .iter()
        .find_map(|l| rtpmap(l).filter(|(_, enc)| *enc == clock).map(|(pt, _)| pt.to_owned()))
    {
        lines.retain(|l| {
            let target = Some(pt.as_str());
            attr_payload(l, "a=rtpmap:") != target
                && attr_payload(l, "a=rtcp-fb:") != target
                && attr_payload(l, "a=fmtp:") != target
        });

        let apt = format!("apt={pt}");
        let rtx = lines.iter().find_map(|l| {
            let (rtx, params) = l.strip_prefix("a=fmtp:")?.split_once(' ')?;
            (params == apt).then(|| rtx.to_owned())
        });
        if let Some(rtx) = rtx.as_deref() {
            lines.retain(|l| {
                attr_payload(l, "a=fmtp:") != Some(rtx) && attr_payload(l, "a=rtpmap:") != Some(rtx)
            });
        }

        if let Some(mline) = lines.iter_mut().find(|l| l.starts_with("m=video")) {
            *mline = mline
                .split(' ')
                .enumerate()
                .filter(|(i, tok)| *i < 3 || (*tok != pt && Some(*tok) != rtx.as_deref()))
                .map(|(_, tok)| tok)
                .collect::<Vec<_>>()
                .join(" ");
        }
    }
}

/// `a=rtpmap:<pt> <encoding>` split into its two halves.
fn rtpmap(line: &str) -> Option<(&str, &str)> {
    line.strip_prefix("a=rtpmap:")?.split_once(' ')
}

fn attr_payload<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix)?.split(' ').next()
}
