mod test_channel_routing;
