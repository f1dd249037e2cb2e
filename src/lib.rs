// A minimal TFTP (RFC 1350) client and server, octet mode only.
//
// Transfers move a file in DATA blocks of up to 512 bytes. Stop-and-wait:
// exactly one packet is unacknowledged at any time, each DATA must be acked
// before the next goes out, and a block shorter than 512 bytes ends the
// transfer. Loss is recovered by timeout-driven retransmission of the last
// sent packet; block-number mismatches identify duplicates, which are
// ignored without a reply.
//
// A transfer is addressed by its TID pair, carried as UDP ports. The client
// picks an ephemeral port and sends its RRQ or WRQ to the well-known server
// port; the server answers from a freshly bound ephemeral port, and that
// reply fixes the session TID for both directions. ERROR packets are a
// courtesy: never acked, never retransmitted, and most of them terminate
// the session.
//
// Layering here: `wire` is the codec, `socket`/`timer` are the transport and
// timing collaborators, `transfer` holds the block engines shared by both
// roles, `session` owns per-transfer state and the event dispatch loop, and
// `client`/`server` are the two role state machines on top.

pub mod client;
pub mod config;
pub mod server;
pub mod session;
pub mod socket;
pub mod timer;
pub mod transfer;
pub mod wire;
