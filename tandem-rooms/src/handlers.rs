//! Envelope dispatch.
//!
//! Every client message code maps to exactly one handler in [`HANDLERS`].
//! Adding a message means adding a row there; codes without a row are
//! dropped.

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::error::RoomError;
use crate::protocol::{envelope_code, ClientMsgCode, UpdatePresence};
use crate::rooms::{JoinedConnection, RoomService};

/// What a handler may touch: the room service and the caller's connection.
pub struct HandlerContext<'a> {
    pub rooms: &'a RoomService,
    pub connection: &'a JoinedConnection,
}

pub type HandlerFn =
    for<'a> fn(&'a HandlerContext<'a>, Value) -> BoxFuture<'a, Result<(), RoomError>>;

pub const HANDLERS: &[(ClientMsgCode, HandlerFn)] = &[(
    ClientMsgCode::UpdatePresence,
    handle_update_presence as HandlerFn,
)];

/// Result of dispatching one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled(ClientMsgCode),
    /// Not an envelope, no `type`, or no handler for it.
    Ignored,
}

pub fn lookup(code: ClientMsgCode) -> Option<HandlerFn> {
    HANDLERS
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, handler)| *handler)
}

/// Route one envelope to its handler.
///
/// Returns `Err` only when a handler fails; unroutable envelopes come back
/// as [`Dispatch::Ignored`].
pub async fn dispatch(ctx: &HandlerContext<'_>, envelope: Value) -> Result<Dispatch, RoomError> {
    let code = match envelope_code(&envelope) {
        Ok(code) => code,
        Err(e) => {
            log::debug!(
                "Actor {} sent an unroutable envelope: {e}",
                ctx.connection.connection_id
            );
            return Ok(Dispatch::Ignored);
        }
    };

    let Some((code, handler)) = ClientMsgCode::from_code(code)
        .and_then(|known| lookup(known).map(|handler| (known, handler)))
    else {
        log::debug!(
            "Actor {} sent unknown message type {code}",
            ctx.connection.connection_id
        );
        return Ok(Dispatch::Ignored);
    };

    handler(ctx, envelope).await?;
    Ok(Dispatch::Handled(code))
}

fn handle_update_presence<'a>(
    ctx: &'a HandlerContext<'a>,
    envelope: Value,
) -> BoxFuture<'a, Result<(), RoomError>> {
    Box::pin(async move {
        let update: UpdatePresence = serde_json::from_value(envelope)?;
        ctx.rooms.update_presence(ctx.connection, update).await
    })
}
