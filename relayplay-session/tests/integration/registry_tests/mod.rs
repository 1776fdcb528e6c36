mod test_slot_lifecycle;
