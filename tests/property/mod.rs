mod ordering_proptest;
mod reaction_proptest;
mod read_status_proptest;
