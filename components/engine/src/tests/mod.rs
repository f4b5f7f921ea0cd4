use ibft_messages::{NodeId, Payload, View};

mod round;
mod state;

fn view(height: u64, round: u64) -> View {
    View { height, round }
}

fn payload(s: &str) -> Payload {
    Payload(s.as_bytes().to_vec())
}

fn id(s: &str) -> NodeId {
    NodeId::new(s)
}
