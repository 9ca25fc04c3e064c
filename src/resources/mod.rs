pub mod namespacelabels;
