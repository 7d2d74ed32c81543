//! SendTargets discovery (RFC 3720 Appendix D)

use crate::messages::{TextRequest, TextResponse};
use crate::pdu::{serialize_text_parameters, RESERVED_TAG};
use crate::target::{find_target, IscsiTarget};
use std::net::SocketAddr;
use std::sync::Arc;

/// Portal group tag of the single portal the server listens on
pub const PORTAL_GROUP_TAG: u16 = 1;

/// Build the Text Response for a Text Request.
///
/// `SendTargets=All` lists every target, `SendTargets=<name>` only that one;
/// each target is followed by the portal the initiator connected to. Any
/// other key is answered with `NotUnderstood`.
pub fn text_response(
    request: &TextRequest,
    targets: &[Arc<IscsiTarget>],
    portal: SocketAddr,
) -> TextResponse {
    let mut answers = Vec::new();
    // An undecodable data segment gets an empty answer
    let keys = request.parameters().unwrap_or_default();

    for (key, value) in keys {
        if key != "SendTargets" {
            answers.push((key, "NotUnderstood".to_string()));
            continue;
        }

        let listed: Vec<&Arc<IscsiTarget>> = if value == "All" {
            targets.iter().collect()
        } else {
            find_target(targets, &value).into_iter().collect()
        };
        for target in listed {
            answers.push(("TargetName".to_string(), target.name().to_string()));
            answers.push((
                "TargetAddress".to_string(),
                format!("{},{}", portal, PORTAL_GROUP_TAG),
            ));
        }
    }

    TextResponse {
        final_flag: true,
        cont: false,
        lun: 0,
        itt: request.itt,
        ttt: RESERVED_TAG,
        stat_sn: 0,
        exp_cmd_sn: 0,
        max_cmd_sn: 0,
        data: serialize_text_parameters(&answers),
    }
}
